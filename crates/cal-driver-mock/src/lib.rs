//! Mock bench instruments
//!
//! Simulated devices for running the calibration state machine without
//! hardware. All async mocks use `tokio::time::sleep`; the filter wheel is
//! deliberately blocking and goes through the sync adapter.
//!
//! # Available Mock Drivers
//!
//! - [`MockMonochromator`] - CS260 with gratings, order-sort filters and shutter
//! - [`MockLockin`] - SR510/SR830 with settle-then-poll measurement
//! - [`MockNdfWheel`] - blocking NDF filter wheel
//! - [`MockDetector`] - S401C thermal power detector
//!
//! # Driver Factory Pattern
//!
//! ```rust,ignore
//! let registry = InstrumentRegistry::new();
//! for factory in cal_driver_mock::factories() {
//!     registry.register_factory(factory);
//! }
//! ```

pub mod common;
mod mock_detector;
mod mock_lockin;
mod mock_monochromator;
mod mock_ndf_wheel;

use cal_core::InstrumentFactory;

pub use common::{FaultConfig, FaultInjector, MockMode};
pub use mock_detector::{MockDetector, MockDetectorConfig, MockDetectorFactory};
pub use mock_lockin::{MockLockin, MockLockinConfig, MockLockinFactory, DEFAULT_SETTLE_MULTIPLIER};
pub use mock_monochromator::{
    MockMonochromator, MockMonochromatorConfig, MockMonochromatorFactory,
};
pub use mock_ndf_wheel::{MockNdfWheel, MockNdfWheelConfig, MockNdfWheelFactory};

/// Every mock factory, ready for registration.
pub fn factories() -> Vec<Box<dyn InstrumentFactory>> {
    vec![
        Box::new(MockMonochromatorFactory),
        Box::new(MockLockinFactory),
        Box::new(MockNdfWheelFactory),
        Box::new(MockDetectorFactory),
    ]
}
