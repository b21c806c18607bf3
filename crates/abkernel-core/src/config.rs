use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::bucketing::AdaptivePolicy;
use crate::{ExperimentError, CONTROL_VARIANT, CONVERSION_EVENT};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    pub adaptive_min_assignments: u64,
    pub adaptive_max_deviation_pct: f64,
    pub conversion_event: String,
    pub fallback_variant: String,
    /// Zero disables expiry.
    pub cache_ttl_secs: u64,
    /// Gate new users on `traffic_allocation` before bucketing. Off by default
    /// so every user reaching an experiment is bucketed.
    pub enforce_traffic_allocation: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            adaptive_min_assignments: 20,
            adaptive_max_deviation_pct: 5.0,
            conversion_event: CONVERSION_EVENT.to_string(),
            fallback_variant: CONTROL_VARIANT.to_string(),
            cache_ttl_secs: 3600,
            enforce_traffic_allocation: false,
        }
    }
}

impl EngineConfig {
    /// Validates configuration bounds.
    ///
    /// # Errors
    /// Returns [`ExperimentError::Validation`] when a field is out of range.
    pub fn validate(&self) -> Result<(), ExperimentError> {
        if !(0.0..=100.0).contains(&self.adaptive_max_deviation_pct) {
            return Err(ExperimentError::Validation(
                "adaptive_max_deviation_pct MUST be in [0, 100]".to_string(),
            ));
        }

        if self.conversion_event.trim().is_empty() {
            return Err(ExperimentError::Validation(
                "conversion_event MUST be non-empty".to_string(),
            ));
        }

        if self.fallback_variant.trim().is_empty() {
            return Err(ExperimentError::Validation(
                "fallback_variant MUST be non-empty".to_string(),
            ));
        }

        Ok(())
    }

    /// Decodes and validates a configuration from JSON. Missing keys take
    /// their defaults.
    ///
    /// # Errors
    /// Returns [`ExperimentError::Validation`] when decoding fails or the
    /// decoded values are out of range.
    pub fn from_json(value: &Value) -> Result<Self, ExperimentError> {
        let config: Self = serde_json::from_value(value.clone()).map_err(|err| {
            ExperimentError::Validation(format!("invalid engine config JSON payload: {err}"))
        })?;
        config.validate()?;
        Ok(config)
    }

    #[must_use]
    pub fn adaptive_policy(&self) -> AdaptivePolicy {
        AdaptivePolicy {
            min_assignments: self.adaptive_min_assignments,
            max_deviation_pct: self.adaptive_max_deviation_pct,
        }
    }

    #[must_use]
    pub fn cache_ttl(&self) -> Option<Duration> {
        (self.cache_ttl_secs > 0).then(|| Duration::from_secs(self.cache_ttl_secs))
    }
}

/// Persistence settings supplied by the caller.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StoreConfig {
    /// How long a call waits on a locked database before reporting the store
    /// as unavailable.
    pub busy_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            busy_timeout_ms: 5_000,
        }
    }
}

impl StoreConfig {
    #[must_use]
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}
