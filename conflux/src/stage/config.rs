//! Stage configuration.

use crate::channel::{Capacity, OverflowPolicy};
use crate::errors::ConfigValidationError;
use serde::{Deserialize, Serialize};

/// Configuration for a stage's channels and worker pool.
///
/// Every value is explicit; there is no default configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageConfig {
    /// Capacity of the stage's input and output channels.
    pub capacity: Capacity,
    /// Overflow policy of the stage's input and output channels.
    pub overflow_policy: OverflowPolicy,
    /// Number of concurrent workers (at least 1).
    pub parallelism: usize,
    /// Whether outputs are released in input order when `parallelism > 1`.
    pub ordered: bool,
}

impl StageConfig {
    /// Creates a validated configuration.
    pub fn new(
        capacity: Capacity,
        overflow_policy: OverflowPolicy,
        parallelism: usize,
        ordered: bool,
    ) -> Result<Self, ConfigValidationError> {
        if parallelism == 0 {
            return Err(ConfigValidationError::new(
                "stage parallelism must be at least 1",
            ));
        }
        Ok(Self {
            capacity,
            overflow_policy,
            parallelism,
            ordered,
        })
    }

    /// Creates a single-worker configuration (`parallelism = 1`, unordered -
    /// a single worker already preserves order).
    #[must_use]
    pub fn serial(capacity: Capacity, overflow_policy: OverflowPolicy) -> Self {
        Self {
            capacity,
            overflow_policy,
            parallelism: 1,
            ordered: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_parallelism_rejected() {
        let err = StageConfig::new(Capacity::bounded(1), OverflowPolicy::Wait, 0, false);
        assert!(err.is_err());
    }

    #[test]
    fn test_serial_config() {
        let config = StageConfig::serial(Capacity::Unbounded, OverflowPolicy::Wait);
        assert_eq!(config.parallelism, 1);
        assert!(!config.ordered);
    }

    #[test]
    fn test_config_round_trips_through_json() {
        let config = StageConfig::new(Capacity::bounded(8), OverflowPolicy::DropOldest, 4, true)
            .unwrap();
        let value = serde_json::to_value(&config).unwrap();
        let back: StageConfig = serde_json::from_value(value).unwrap();
        assert_eq!(back, config);
    }
}
