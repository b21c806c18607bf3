//! Per-request decision context.
//!
//! A [`RequestContext`] carries debug overrides into the engine and collects
//! every decision made while serving one request, so a debug surface can show
//! which experiments were touched without any process-wide state.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::bucketing::Allocation;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FallbackReason {
    ExperimentNotFound,
    NotLive,
    OutsideTrafficAllocation,
    StoreUnavailable,
    StoreError,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case", tag = "kind", content = "detail")]
pub enum DecisionSource {
    Override,
    Fallback(FallbackReason),
    Cached,
    Existing,
    Assigned(Allocation),
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Decision {
    pub experiment: String,
    pub variant: String,
    pub source: DecisionSource,
}

impl Decision {
    /// True when the decision is backed by a persisted assignment.
    #[must_use]
    pub fn is_sticky(&self) -> bool {
        matches!(
            self.source,
            DecisionSource::Cached | DecisionSource::Existing | DecisionSource::Assigned(_)
        )
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct RequestContext {
    overrides: BTreeMap<String, String>,
    exposures: Vec<Decision>,
}

impl RequestContext {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Forces `variant` for `experiment` during this request. Values that are
    /// not declared variants of the experiment are ignored at resolution time.
    #[must_use]
    pub fn with_override(mut self, experiment: impl Into<String>, variant: impl Into<String>) -> Self {
        self.set_override(experiment, variant);
        self
    }

    pub fn set_override(&mut self, experiment: impl Into<String>, variant: impl Into<String>) {
        self.overrides.insert(experiment.into(), variant.into());
    }

    /// Parses `experiment=variant` pairs as passed through a debug side channel.
    pub fn extend_overrides<'a>(&mut self, pairs: impl IntoIterator<Item = &'a str>) {
        for pair in pairs {
            if let Some((experiment, variant)) = pair.split_once('=') {
                let (experiment, variant) = (experiment.trim(), variant.trim());
                if !experiment.is_empty() && !variant.is_empty() {
                    self.set_override(experiment, variant);
                }
            }
        }
    }

    #[must_use]
    pub fn override_for(&self, experiment: &str) -> Option<&str> {
        self.overrides.get(experiment).map(String::as_str)
    }

    pub fn record(&mut self, decision: Decision) {
        self.exposures.push(decision);
    }

    /// Decisions in the order they were made.
    #[must_use]
    pub fn exposures(&self) -> &[Decision] {
        &self.exposures
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn side_channel_pairs_are_parsed_and_blank_ones_skipped() {
        let mut context = RequestContext::new();
        context.extend_overrides(["checkout=variant_a", " pricing = control ", "broken", "x="]);
        assert_eq!(context.override_for("checkout"), Some("variant_a"));
        assert_eq!(context.override_for("pricing"), Some("control"));
        assert_eq!(context.override_for("broken"), None);
        assert_eq!(context.override_for("x"), None);
    }

    #[test]
    fn exposures_keep_decision_order() {
        let mut context = RequestContext::new();
        for variant in ["control", "variant_a"] {
            context.record(Decision {
                experiment: "checkout".to_string(),
                variant: variant.to_string(),
                source: DecisionSource::Override,
            });
        }
        let variants: Vec<&str> = context
            .exposures()
            .iter()
            .map(|decision| decision.variant.as_str())
            .collect();
        assert_eq!(variants, vec!["control", "variant_a"]);
    }
}
