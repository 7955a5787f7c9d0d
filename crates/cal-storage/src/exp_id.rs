//! Experiment ids: `<YYYYMMDD>_<HHMMSS>_<ordinal>`.
//!
//! The date/time prefix is fixed when a run starts; the ordinal is the
//! 1-based step number within the run, so every record of one run sorts
//! together and in order.

use chrono::{DateTime, TimeZone};
use std::fmt::Display;

/// Generates experiment ids for one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpIdGenerator {
    prefix: String,
}

impl ExpIdGenerator {
    /// Generator whose prefix is taken from `start`.
    pub fn starting_at<Tz>(start: &DateTime<Tz>) -> Self
    where
        Tz: TimeZone,
        Tz::Offset: Display,
    {
        Self {
            prefix: start.format("%Y%m%d_%H%M%S").to_string(),
        }
    }

    /// Generator starting now (local time).
    pub fn now() -> Self {
        Self::starting_at(&chrono::Local::now())
    }

    /// Id for flat control-loop index `index` (ordinal `index + 1`).
    pub fn id_for(&self, index: usize) -> String {
        format!("{}_{}", self.prefix, index + 1)
    }

    /// The shared date/time prefix.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn ids_share_prefix_and_count_from_one() {
        let start = Utc.with_ymd_and_hms(2024, 1, 2, 10, 15, 30).unwrap();
        let ids = ExpIdGenerator::starting_at(&start);
        assert_eq!(ids.id_for(0), "20240102_101530_1");
        assert_eq!(ids.id_for(41), "20240102_101530_42");
    }
}
