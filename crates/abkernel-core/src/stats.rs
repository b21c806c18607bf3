//! Conversion summaries and the two-proportion z-test.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{Experiment, ExperimentStatus, CONTROL_VARIANT};

pub const MESSAGE_SIGNIFICANT: &str = "Statistically significant difference detected";
pub const MESSAGE_NOT_SIGNIFICANT: &str = "No statistically significant difference";
pub const MESSAGE_INSUFFICIENT_SAMPLE: &str = "Insufficient sample size";
pub const MESSAGE_NO_VARIANCE: &str = "No variance in data";

// Abramowitz-Stegun 7.1.26 coefficients.
const ERF_A1: f64 = 0.254_829_592;
const ERF_A2: f64 = -0.284_496_736;
const ERF_A3: f64 = 1.421_413_741;
const ERF_A4: f64 = -1.453_152_027;
const ERF_A5: f64 = 1.061_405_429;
const ERF_P: f64 = 0.327_591_1;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VariantResult {
    pub variant: String,
    pub weight: u8,
    pub assignments: u64,
    pub conversions: u64,
    pub conversion_rate: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResultTotals {
    pub assignments: u64,
    pub conversions: u64,
    pub conversion_rate: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExperimentResults {
    pub contract_version: String,
    pub experiment: String,
    pub status: ExperimentStatus,
    pub is_live: bool,
    pub variants: Vec<VariantResult>,
    pub totals: ResultTotals,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SignificanceOutcome {
    Evaluated,
    InsufficientSampleSize,
    NoVariance,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SignificanceReport {
    pub contract_version: String,
    pub experiment: String,
    pub variant: String,
    pub outcome: SignificanceOutcome,
    pub significant: bool,
    pub confidence: f64,
    pub p_value: f64,
    pub z_score: f64,
    pub message: String,
}

/// Sample counts of one arm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ArmCounts {
    pub assignments: u64,
    pub conversions: u64,
}

/// Result of [`two_proportion_z_test`] before it is attached to an experiment.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ZTest {
    pub outcome: SignificanceOutcome,
    pub significant: bool,
    pub confidence: f64,
    pub p_value: f64,
    pub z_score: f64,
}

impl ZTest {
    #[must_use]
    pub fn message(&self) -> &'static str {
        match self.outcome {
            SignificanceOutcome::InsufficientSampleSize => MESSAGE_INSUFFICIENT_SAMPLE,
            SignificanceOutcome::NoVariance => MESSAGE_NO_VARIANCE,
            SignificanceOutcome::Evaluated if self.significant => MESSAGE_SIGNIFICANT,
            SignificanceOutcome::Evaluated => MESSAGE_NOT_SIGNIFICANT,
        }
    }

    fn inconclusive(outcome: SignificanceOutcome) -> Self {
        Self {
            outcome,
            significant: false,
            confidence: 0.0,
            p_value: 1.0,
            z_score: 0.0,
        }
    }
}

/// Rounds half away from zero to `decimals` places.
#[must_use]
pub fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10_f64.powi(decimals);
    (value * factor).round() / factor
}

/// Conversion rate in percent with two decimals; zero for an empty arm.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn conversion_rate_pct(conversions: u64, assignments: u64) -> f64 {
    if assignments == 0 {
        return 0.0;
    }
    round_to(conversions as f64 / assignments as f64 * 100.0, 2)
}

#[must_use]
pub fn erf(x: f64) -> f64 {
    let sign = if x < 0.0 { -1.0 } else { 1.0 };
    let x = x.abs();
    let t = 1.0 / (1.0 + ERF_P * x);
    let polynomial = ((((ERF_A5 * t + ERF_A4) * t + ERF_A3) * t + ERF_A2) * t + ERF_A1) * t;
    sign * (1.0 - polynomial * (-x * x).exp())
}

#[must_use]
pub fn normal_cdf(x: f64) -> f64 {
    0.5 * (1.0 + erf(x / std::f64::consts::SQRT_2))
}

/// Two-proportion z-test of `variant` against `control` with a pooled
/// standard error.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn two_proportion_z_test(
    control: ArmCounts,
    variant: ArmCounts,
    minimum_sample_size: u32,
    confidence_level: f64,
) -> ZTest {
    let minimum = u64::from(minimum_sample_size);
    if control.assignments < minimum
        || variant.assignments < minimum
        || control.assignments == 0
        || variant.assignments == 0
    {
        return ZTest::inconclusive(SignificanceOutcome::InsufficientSampleSize);
    }

    let n_control = control.assignments as f64;
    let n_variant = variant.assignments as f64;
    let p_control = control.conversions as f64 / n_control;
    let p_variant = variant.conversions as f64 / n_variant;

    let pooled = (control.conversions + variant.conversions) as f64 / (n_control + n_variant);
    let standard_error =
        (pooled * (1.0 - pooled) * (1.0 / n_control + 1.0 / n_variant)).sqrt();

    if standard_error <= 0.0 || !standard_error.is_finite() {
        return ZTest::inconclusive(SignificanceOutcome::NoVariance);
    }

    let z_score = (p_variant - p_control) / standard_error;
    let p_value = 2.0 * (1.0 - normal_cdf(z_score.abs()));
    let alpha = 1.0 - confidence_level / 100.0;

    ZTest {
        outcome: SignificanceOutcome::Evaluated,
        significant: p_value < alpha,
        confidence: round_to((1.0 - p_value) * 100.0, 2),
        p_value: round_to(p_value, 4),
        z_score: round_to(z_score, 3),
    }
}

/// Builds per-variant results in declaration order.
#[must_use]
pub fn summarize(
    experiment: &Experiment,
    assignments: &BTreeMap<String, u64>,
    conversions: &BTreeMap<String, u64>,
    is_live: bool,
) -> ExperimentResults {
    let variants: Vec<VariantResult> = experiment
        .variants
        .iter()
        .map(|variant| {
            let assigned = assignments.get(&variant.name).copied().unwrap_or(0);
            let converted = conversions.get(&variant.name).copied().unwrap_or(0);
            VariantResult {
                variant: variant.name.clone(),
                weight: variant.weight,
                assignments: assigned,
                conversions: converted,
                conversion_rate: conversion_rate_pct(converted, assigned),
            }
        })
        .collect();

    let total_assignments = variants.iter().map(|item| item.assignments).sum();
    let total_conversions = variants.iter().map(|item| item.conversions).sum();

    ExperimentResults {
        contract_version: "experiment_results.v1".to_string(),
        experiment: experiment.name.clone(),
        status: experiment.status,
        is_live,
        variants,
        totals: ResultTotals {
            assignments: total_assignments,
            conversions: total_conversions,
            conversion_rate: conversion_rate_pct(total_conversions, total_assignments),
        },
    }
}

/// Compares `variant` against the control arm of an already summarized
/// experiment.
#[must_use]
pub fn significance(
    experiment: &Experiment,
    results: &ExperimentResults,
    variant: &str,
) -> SignificanceReport {
    let arm = |name: &str| {
        results
            .variants
            .iter()
            .find(|item| item.variant == name)
            .map_or_else(ArmCounts::default, |item| ArmCounts {
                assignments: item.assignments,
                conversions: item.conversions,
            })
    };

    let test = two_proportion_z_test(
        arm(CONTROL_VARIANT),
        arm(variant),
        experiment.minimum_sample_size,
        experiment.confidence_level,
    );

    SignificanceReport {
        contract_version: "significance.v1".to_string(),
        experiment: experiment.name.clone(),
        variant: variant.to_string(),
        outcome: test.outcome,
        significant: test.significant,
        confidence: test.confidence,
        p_value: test.p_value,
        z_score: test.z_score,
        message: test.message().to_string(),
    }
}
