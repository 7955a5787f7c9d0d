//! Storage for archived calibration measurements.
//!
//! - [`JsonArchive`]: daily `{"Measurements": [...]}` files, read-modify-rewrite
//! - [`SampleCsvWriter`]: raw samples per sequence and instrument
//! - [`ExpIdGenerator`]: `<YYYYMMDD>_<HHMMSS>_<ordinal>` record ids

pub mod csv_writer;
pub mod exp_id;
pub mod json_archive;

pub use csv_writer::SampleCsvWriter;
pub use exp_id::ExpIdGenerator;
pub use json_archive::JsonArchive;
