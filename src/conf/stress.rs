use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Workload for the stress harness: how much to append and how often the
/// background spiller fires.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct StressConfig {
    #[serde(default = "StressConfig::default_records")]
    pub records: u64,
    #[serde(default = "StressConfig::default_fields")]
    pub fields: usize,
    #[serde(
        with = "humantime_serde",
        default = "StressConfig::default_spill_interval"
    )]
    pub spill_interval: Duration,
    #[serde(default = "StressConfig::default_spill_during_iteration")]
    pub spill_during_iteration: bool,
}

impl StressConfig {
    fn default_records() -> u64 {
        100_000
    }
    fn default_fields() -> usize {
        5
    }
    fn default_spill_interval() -> Duration {
        Duration::from_millis(1)
    }
    fn default_spill_during_iteration() -> bool {
        true
    }
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            records: Self::default_records(),
            fields: Self::default_fields(),
            spill_interval: Self::default_spill_interval(),
            spill_during_iteration: Self::default_spill_during_iteration(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stress_default() {
        let stress = StressConfig::default();
        assert_eq!(stress.records, 100_000);
        assert_eq!(stress.fields, 5);
        assert_eq!(stress.spill_interval, Duration::from_millis(1));
    }
}
