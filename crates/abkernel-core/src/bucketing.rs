//! Variant selection: stable hash bucketing and adaptive rebalancing.
//!
//! Hash bucketing maps `md5(experiment ++ user)` onto a 1..=100 percentage
//! and walks the declared variants accumulating weights. Adaptive
//! rebalancing kicks in once an experiment has enough assignments and steers
//! new users toward the most under-represented arm. Rebalanced users are not
//! reproducible from the hash alone; their variant depends on the traffic
//! that preceded them.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{Variant, CONTROL_VARIANT};

const DEVIATION_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    Hash,
    Adaptive,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct AdaptivePolicy {
    pub min_assignments: u64,
    pub max_deviation_pct: f64,
}

impl Default for AdaptivePolicy {
    fn default() -> Self {
        Self {
            min_assignments: 20,
            max_deviation_pct: 5.0,
        }
    }
}

impl AdaptivePolicy {
    #[must_use]
    pub fn strategy_for(&self, total_assignments: u64) -> Strategy {
        if total_assignments >= self.min_assignments {
            Strategy::Adaptive
        } else {
            Strategy::Hash
        }
    }
}

/// How a new assignment was chosen.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Allocation {
    /// Plain hash bucketing (below the adaptive threshold).
    Hashed,
    /// Adaptive mode was engaged but the split was close enough to target.
    HashedWithinTolerance,
    /// Adaptive mode routed the user to an under-represented arm.
    Rebalanced,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationChoice {
    pub variant: String,
    pub allocation: Allocation,
}

/// First 32 bits of `md5(experiment ++ user_id)`, read big-endian.
#[must_use]
pub fn bucket_hash(experiment: &str, user_id: &str) -> u32 {
    let mut context = md5::Context::new();
    context.consume(experiment.as_bytes());
    context.consume(user_id.as_bytes());
    let bytes = context.compute().0;
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

/// Percentage in `1..=100` used for the weight walk.
#[must_use]
pub fn bucket_percentage(experiment: &str, user_id: &str) -> u32 {
    bucket_hash(experiment, user_id) % 100 + 1
}

/// Walks variants in declaration order; the first whose cumulative weight
/// reaches `percentage` wins.
#[must_use]
pub fn select_by_weight(variants: &[Variant], percentage: u32) -> Option<&Variant> {
    let mut cumulative = 0_u32;
    for variant in variants {
        cumulative += u32::from(variant.weight);
        if cumulative >= percentage {
            return Some(variant);
        }
    }
    None
}

/// Hash bucketing with the control fallback for weight maps short of 100.
#[must_use]
pub fn hash_assign(experiment: &str, variants: &[Variant], user_id: &str) -> String {
    let percentage = bucket_percentage(experiment, user_id);
    select_by_weight(variants, percentage)
        .map_or_else(|| CONTROL_VARIANT.to_string(), |variant| variant.name.clone())
}

/// Target weight minus actual share (in percentage points) per declared variant.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn deviations(variants: &[Variant], counts: &BTreeMap<String, u64>) -> Vec<(String, f64)> {
    let total: u64 = counts.values().sum();
    variants
        .iter()
        .map(|variant| {
            let assigned = counts.get(&variant.name).copied().unwrap_or(0);
            let actual = if total == 0 {
                0.0
            } else {
                assigned as f64 / total as f64 * 100.0
            };
            (variant.name.clone(), f64::from(variant.weight) - actual)
        })
        .collect()
}

/// Chooses a variant for a brand-new user given the current assignment counts.
#[must_use]
pub fn allocate(
    experiment: &str,
    variants: &[Variant],
    counts: &BTreeMap<String, u64>,
    user_id: &str,
    policy: &AdaptivePolicy,
) -> AllocationChoice {
    let total: u64 = counts.values().sum();
    match policy.strategy_for(total) {
        Strategy::Hash => AllocationChoice {
            variant: hash_assign(experiment, variants, user_id),
            allocation: Allocation::Hashed,
        },
        Strategy::Adaptive => rebalance(experiment, variants, counts, user_id, policy),
    }
}

fn rebalance(
    experiment: &str,
    variants: &[Variant],
    counts: &BTreeMap<String, u64>,
    user_id: &str,
    policy: &AdaptivePolicy,
) -> AllocationChoice {
    let deviations = deviations(variants, counts);
    let max_deviation = deviations
        .iter()
        .map(|(_, deviation)| *deviation)
        .fold(f64::NEG_INFINITY, f64::max);

    if deviations.is_empty() || max_deviation < policy.max_deviation_pct {
        return AllocationChoice {
            variant: hash_assign(experiment, variants, user_id),
            allocation: Allocation::HashedWithinTolerance,
        };
    }

    let tied: Vec<&String> = deviations
        .iter()
        .filter(|(_, deviation)| (max_deviation - deviation).abs() < DEVIATION_EPSILON)
        .map(|(name, _)| name)
        .collect();

    let index = if tied.len() > 1 {
        usize::try_from(bucket_hash(experiment, user_id)).unwrap_or(0) % tied.len()
    } else {
        0
    };

    AllocationChoice {
        variant: tied[index].clone(),
        allocation: Allocation::Rebalanced,
    }
}

/// Salted bucket deciding whether a new user is admitted by
/// `traffic_allocation`. Uses a different salt than variant bucketing so the
/// admitted population is not skewed toward the first variants.
#[must_use]
pub fn within_traffic_allocation(experiment: &str, user_id: &str, traffic_allocation: u8) -> bool {
    let mut salted = String::with_capacity(experiment.len() + 8);
    salted.push_str(experiment);
    salted.push_str(":traffic");
    bucket_percentage(&salted, user_id) <= u32::from(traffic_allocation)
}
