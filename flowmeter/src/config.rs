use std::time::Duration;

/// Errors produced by counter configuration validation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// A configuration field violates an invariant. The field name matches
    /// the configuration file key.
    #[error("invalid counter config `{field}`: {reason}")]
    Invalid {
        field: &'static str,
        reason: &'static str,
    },
}

/// Sliding-window shape shared by both counter variants.
///
/// Immutable after construction. The window is divided into slots of
/// `precision` length; the slot ring must cover the whole window
/// (`slots * precision >= window`) or old and current buckets would collide.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CounterConfig {
    /// Duration over which events are aggregated.
    pub window: Duration,
    /// Number of slots in the ring.
    pub slots: usize,
    /// Length of one slot; every timestamp is bucketed to this granularity.
    pub precision: Duration,
}

impl Default for CounterConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(1),
            slots: 10,
            precision: Duration::from_millis(100),
        }
    }
}

impl CounterConfig {
    /// Checks the window invariants.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.window.is_zero() {
            return Err(ConfigError::Invalid {
                field: "window_size",
                reason: "must be greater than zero",
            });
        }
        if self.slots == 0 {
            return Err(ConfigError::Invalid {
                field: "slot_num",
                reason: "must be greater than zero",
            });
        }
        if self.precision.is_zero() {
            return Err(ConfigError::Invalid {
                field: "precision",
                reason: "must be greater than zero",
            });
        }
        if self.precision > self.window {
            return Err(ConfigError::Invalid {
                field: "precision",
                reason: "must not exceed window_size",
            });
        }
        if self.precision.as_nanos() * (self.slots as u128) < self.window.as_nanos() {
            return Err(ConfigError::Invalid {
                field: "slot_num",
                reason: "slot_num * precision must cover window_size",
            });
        }
        Ok(())
    }

    pub(crate) fn window_ns(&self) -> u64 {
        self.window.as_nanos() as u64
    }

    pub(crate) fn precision_ns(&self) -> u64 {
        self.precision.as_nanos() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert_eq!(CounterConfig::default().validate(), Ok(()));
    }

    #[test]
    fn test_validation_names_the_offending_field() {
        let cases = [
            (
                CounterConfig {
                    window: Duration::ZERO,
                    ..CounterConfig::default()
                },
                "window_size",
            ),
            (
                CounterConfig {
                    slots: 0,
                    ..CounterConfig::default()
                },
                "slot_num",
            ),
            (
                CounterConfig {
                    precision: Duration::ZERO,
                    ..CounterConfig::default()
                },
                "precision",
            ),
            (
                CounterConfig {
                    precision: Duration::from_secs(2),
                    ..CounterConfig::default()
                },
                "precision",
            ),
            (
                CounterConfig {
                    slots: 3,
                    ..CounterConfig::default()
                },
                "slot_num",
            ),
        ];

        for (cfg, expected) in cases {
            match cfg.validate() {
                Err(ConfigError::Invalid { field, .. }) => assert_eq!(field, expected),
                other => panic!("expected invalid `{expected}`, got {other:?}"),
            }
        }
    }
}
