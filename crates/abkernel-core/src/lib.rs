//! Domain model and decision logic for A/B experiment assignment.
//!
//! The crate is storage-agnostic: persistence is injected through
//! [`ExperimentStore`] and memoization through [`cache::Cache`]. The
//! [`engine::ExperimentEngine`] ties both together and exposes the
//! assignment, tracking, statistics and registry operations.

use std::collections::BTreeSet;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::{OffsetDateTime, UtcOffset};
use ulid::Ulid;

pub mod bucketing;
pub mod cache;
pub mod config;
pub mod context;
pub mod engine;
pub mod stats;
mod store;

pub use store::{
    EventKey, EventSummary, EventUpsert, ExperimentStore, ResetReport, UserAssignment,
};

/// Variant every caller falls back to when no experiment decision can be made.
pub const CONTROL_VARIANT: &str = "control";

/// Event name used for conversion-rate statistics.
pub const CONVERSION_EVENT: &str = "conversion";

/// Free-form properties attached to a tracked event.
pub type Properties = Map<String, Value>;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store conflict: {0}")]
    Conflict(String),
    #[error("store backend error: {0}")]
    Backend(String),
    #[error("corrupt stored row: {0}")]
    Corrupt(String),
}

impl StoreError {
    #[must_use]
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum ExperimentError {
    #[error("experiment not found: {0}")]
    NotFound(String),
    #[error("invalid experiment definition: {0}")]
    InvalidDefinition(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("experiment already exists: {0}")]
    Conflict(String),
    #[error("assignment store unavailable: {0}")]
    StoreUnavailable(String),
    #[error("store error: {0}")]
    Store(String),
}

impl From<StoreError> for ExperimentError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable(message) => Self::StoreUnavailable(message),
            StoreError::Conflict(message) => Self::Conflict(message),
            StoreError::Backend(message) | StoreError::Corrupt(message) => Self::Store(message),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ExperimentStatus {
    Draft,
    Running,
    Paused,
    Completed,
}

impl ExperimentStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "draft" => Some(Self::Draft),
            "running" => Some(Self::Running),
            "paused" => Some(Self::Paused),
            "completed" => Some(Self::Completed),
            _ => None,
        }
    }
}

impl Display for ExperimentStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A named treatment arm and its share of traffic in percent.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Hash)]
pub struct Variant {
    pub name: String,
    pub weight: u8,
}

impl Variant {
    #[must_use]
    pub fn new(name: impl Into<String>, weight: u8) -> Self {
        Self {
            name: name.into(),
            weight,
        }
    }
}

/// Parses `name=weight` pairs such as `control=50`.
///
/// # Errors
/// Returns [`ExperimentError::Validation`] when the pair is malformed or the
/// weight is not an integer in `[0, 100]`.
pub fn parse_variant_pair(raw: &str) -> Result<Variant, ExperimentError> {
    let Some((name, weight)) = raw.split_once('=') else {
        return Err(ExperimentError::Validation(format!(
            "variant must be in <name>=<weight> format: {raw}"
        )));
    };

    let weight: u8 = weight.trim().parse().map_err(|_| {
        ExperimentError::Validation(format!("invalid variant weight in {raw}"))
    })?;

    Ok(Variant::new(name.trim(), weight))
}

/// Checks the variant invariants: at least two arms, unique non-empty names,
/// weights in `[0, 100]` summing to exactly 100.
///
/// # Errors
/// Returns [`ExperimentError::InvalidDefinition`] describing the first
/// violated invariant.
pub fn validate_variants(variants: &[Variant]) -> Result<(), ExperimentError> {
    if variants.len() < 2 {
        return Err(ExperimentError::InvalidDefinition(
            "an experiment MUST declare at least two variants".to_string(),
        ));
    }

    let mut seen = BTreeSet::new();
    let mut total = 0_u32;
    for variant in variants {
        if variant.name.trim().is_empty() {
            return Err(ExperimentError::InvalidDefinition(
                "variant names MUST be non-empty".to_string(),
            ));
        }
        if !seen.insert(variant.name.as_str()) {
            return Err(ExperimentError::InvalidDefinition(format!(
                "duplicate variant name: {}",
                variant.name
            )));
        }
        if variant.weight > 100 {
            return Err(ExperimentError::InvalidDefinition(format!(
                "variant {} weight MUST be in [0, 100]",
                variant.name
            )));
        }
        total += u32::from(variant.weight);
    }

    if total != 100 {
        return Err(ExperimentError::InvalidDefinition(format!(
            "variant weights MUST sum to 100 (got {total})"
        )));
    }

    Ok(())
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Experiment {
    pub id: Ulid,
    pub name: String,
    pub description: String,
    pub variants: Vec<Variant>,
    pub is_active: bool,
    pub status: ExperimentStatus,
    #[serde(with = "time::serde::rfc3339::option")]
    pub start_date: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub end_date: Option<OffsetDateTime>,
    pub traffic_allocation: u8,
    pub minimum_sample_size: u32,
    pub confidence_level: f64,
    pub target_applications: Vec<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl Experiment {
    #[must_use]
    pub fn from_draft(draft: ExperimentDraft, now: OffsetDateTime) -> Self {
        Self {
            id: Ulid::new(),
            name: draft.name,
            description: draft.description,
            variants: draft.variants,
            is_active: draft.is_active,
            status: draft.status,
            start_date: draft.start_date,
            end_date: draft.end_date,
            traffic_allocation: draft.traffic_allocation,
            minimum_sample_size: draft.minimum_sample_size,
            confidence_level: draft.confidence_level,
            target_applications: draft.target_applications,
            created_at: now,
            updated_at: now,
        }
    }

    /// Validates the full experiment definition.
    ///
    /// # Errors
    /// Returns [`ExperimentError::InvalidDefinition`] when the variant map or
    /// any threshold is out of bounds.
    pub fn validate(&self) -> Result<(), ExperimentError> {
        if self.name.trim().is_empty() {
            return Err(ExperimentError::InvalidDefinition(
                "experiment name MUST be non-empty".to_string(),
            ));
        }

        validate_variants(&self.variants)?;

        if self.traffic_allocation > 100 {
            return Err(ExperimentError::InvalidDefinition(
                "traffic_allocation MUST be in [0, 100]".to_string(),
            ));
        }

        if self.minimum_sample_size == 0 {
            return Err(ExperimentError::InvalidDefinition(
                "minimum_sample_size MUST be >= 1".to_string(),
            ));
        }

        if !(self.confidence_level > 0.0 && self.confidence_level < 100.0) {
            return Err(ExperimentError::InvalidDefinition(
                "confidence_level MUST be in (0, 100)".to_string(),
            ));
        }

        if let (Some(start), Some(end)) = (self.start_date, self.end_date) {
            if end < start {
                return Err(ExperimentError::InvalidDefinition(
                    "end_date MUST NOT precede start_date".to_string(),
                ));
            }
        }

        Ok(())
    }

    /// Active, running and inside the schedule window. Missing bounds are open.
    #[must_use]
    pub fn is_live_at(&self, now: OffsetDateTime) -> bool {
        if !self.is_active || self.status != ExperimentStatus::Running {
            return false;
        }
        if self.start_date.is_some_and(|start| now < start) {
            return false;
        }
        if self.end_date.is_some_and(|end| now > end) {
            return false;
        }
        true
    }

    #[must_use]
    pub fn has_variant(&self, name: &str) -> bool {
        self.variants.iter().any(|variant| variant.name == name)
    }

    #[must_use]
    pub fn weight_of(&self, name: &str) -> Option<u8> {
        self.variants
            .iter()
            .find(|variant| variant.name == name)
            .map(|variant| variant.weight)
    }

    /// Caller-side application filter. An empty target list admits every app.
    #[must_use]
    pub fn targets_application(&self, application: &str) -> bool {
        self.target_applications.is_empty()
            || self
                .target_applications
                .iter()
                .any(|candidate| candidate == application)
    }

    pub fn apply_patch(&mut self, patch: ExperimentPatch, now: OffsetDateTime) {
        if let Some(description) = patch.description {
            self.description = description;
        }
        if let Some(variants) = patch.variants {
            self.variants = variants;
        }
        if let Some(is_active) = patch.is_active {
            self.is_active = is_active;
        }
        if let Some(status) = patch.status {
            self.status = status;
        }
        if let Some(start_date) = patch.start_date {
            self.start_date = start_date;
        }
        if let Some(end_date) = patch.end_date {
            self.end_date = end_date;
        }
        if let Some(traffic_allocation) = patch.traffic_allocation {
            self.traffic_allocation = traffic_allocation;
        }
        if let Some(minimum_sample_size) = patch.minimum_sample_size {
            self.minimum_sample_size = minimum_sample_size;
        }
        if let Some(confidence_level) = patch.confidence_level {
            self.confidence_level = confidence_level;
        }
        if let Some(target_applications) = patch.target_applications {
            self.target_applications = target_applications;
        }
        self.updated_at = now;
    }
}

/// Input for creating an experiment. Defaults match a fresh, inactive draft.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ExperimentDraft {
    pub name: String,
    pub description: String,
    pub variants: Vec<Variant>,
    pub is_active: bool,
    pub status: ExperimentStatus,
    #[serde(with = "time::serde::rfc3339::option")]
    pub start_date: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub end_date: Option<OffsetDateTime>,
    pub traffic_allocation: u8,
    pub minimum_sample_size: u32,
    pub confidence_level: f64,
    pub target_applications: Vec<String>,
}

impl Default for ExperimentDraft {
    fn default() -> Self {
        Self {
            name: String::new(),
            description: String::new(),
            variants: Vec::new(),
            is_active: false,
            status: ExperimentStatus::Draft,
            start_date: None,
            end_date: None,
            traffic_allocation: 100,
            minimum_sample_size: 100,
            confidence_level: 95.0,
            target_applications: Vec::new(),
        }
    }
}

impl ExperimentDraft {
    #[must_use]
    pub fn new(name: impl Into<String>, variants: Vec<Variant>) -> Self {
        Self {
            name: name.into(),
            variants,
            ..Self::default()
        }
    }

    /// Shorthand for an experiment that is live immediately.
    #[must_use]
    pub fn running(mut self) -> Self {
        self.is_active = true;
        self.status = ExperimentStatus::Running;
        self
    }
}

/// Partial update. `start_date`/`end_date` use `Some(None)` to clear a bound.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExperimentPatch {
    pub description: Option<String>,
    pub variants: Option<Vec<Variant>>,
    pub is_active: Option<bool>,
    pub status: Option<ExperimentStatus>,
    pub start_date: Option<Option<OffsetDateTime>>,
    pub end_date: Option<Option<OffsetDateTime>>,
    pub traffic_allocation: Option<u8>,
    pub minimum_sample_size: Option<u32>,
    pub confidence_level: Option<f64>,
    pub target_applications: Option<Vec<String>>,
}

/// Sticky mapping of one user to one variant of one experiment.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Assignment {
    pub experiment_id: Ulid,
    pub user_id: String,
    pub variant: String,
    #[serde(with = "time::serde::rfc3339")]
    pub assigned_at: OffsetDateTime,
}

/// Aggregated event row: one per (experiment, user, event, variant).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    pub event_id: i64,
    pub experiment_id: Ulid,
    pub user_id: String,
    pub event_name: String,
    pub variant: String,
    pub count: u64,
    pub properties: Properties,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// Last-write-wins merge of top-level keys; keys absent from `incoming` survive.
#[must_use]
pub fn merge_properties(existing: &Properties, incoming: &Properties) -> Properties {
    let mut merged = existing.clone();
    for (key, value) in incoming {
        merged.insert(key.clone(), value.clone());
    }
    merged
}

/// Parses an RFC3339 timestamp and requires UTC (`Z`) offset.
///
/// # Errors
/// Returns [`ExperimentError::Validation`] when parsing fails or the
/// timestamp is not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, ExperimentError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| ExperimentError::Validation(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(ExperimentError::Validation(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`ExperimentError::Validation`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, ExperimentError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| {
            ExperimentError::Validation(format!("failed to format RFC3339 timestamp: {err}"))
        })
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}
