//! Shared infrastructure for mock instruments.
//!
//! - **mode**: Instant (no delays) or Realistic (hardware-like delays)
//! - **faults**: fault injection for error-path tests
//! - **params**: helpers for pulling typed values out of parameter maps

pub mod faults;
pub mod mode;
pub mod params;

pub use faults::{FaultConfig, FaultInjector};
pub use mode::MockMode;
