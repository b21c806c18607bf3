//! Assignment, tracking, statistics and registry operations over an injected
//! store and cache.
//!
//! Assignment and tracking favor availability: store failures degrade to the
//! fallback variant or a dropped event and are only logged. Registry and
//! statistics calls are explicit queries and return errors normally.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::bucketing::{allocate, within_traffic_allocation};
use crate::cache::{experiment_key, variant_key, variant_prefix, Cache, MemoryCache};
use crate::config::EngineConfig;
use crate::context::{Decision, DecisionSource, FallbackReason, RequestContext};
use crate::stats::{significance, summarize, ExperimentResults, SignificanceReport};
use crate::{
    now_utc, Assignment, EventKey, EventSummary, EventUpsert, Experiment, ExperimentDraft,
    ExperimentError, ExperimentPatch, ExperimentStatus, ExperimentStore, Properties, ResetReport,
    StoreError, UserAssignment,
};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    ExperimentNotFound,
    InvalidEventName,
    StoreUnavailable,
    StoreError,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TrackOutcome {
    Recorded { variant: String, count: u64 },
    Dropped { reason: DropReason },
}

pub struct ExperimentEngine<S, C = MemoryCache> {
    store: S,
    cache: C,
    config: EngineConfig,
}

impl<S: ExperimentStore> ExperimentEngine<S, MemoryCache> {
    #[must_use]
    pub fn new(store: S, config: EngineConfig) -> Self {
        let cache = MemoryCache::new(config.cache_ttl());
        Self::with_cache(store, cache, config)
    }
}

impl<S: ExperimentStore, C: Cache> ExperimentEngine<S, C> {
    #[must_use]
    pub fn with_cache(store: S, cache: C, config: EngineConfig) -> Self {
        Self {
            store,
            cache,
            config,
        }
    }

    #[must_use]
    pub fn store(&self) -> &S {
        &self.store
    }

    #[must_use]
    pub fn cache(&self) -> &C {
        &self.cache
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Returns the variant for `user_id`, honoring an optional debug override.
    /// Never fails: unknown experiments and store outages yield the fallback.
    pub fn get_variant(
        &self,
        experiment: &str,
        user_id: &str,
        override_variant: Option<&str>,
    ) -> String {
        let mut context = RequestContext::new();
        if let Some(variant) = override_variant {
            context.set_override(experiment, variant);
        }
        self.resolve(&mut context, experiment, user_id).variant
    }

    pub fn is_variant(&self, experiment: &str, variant: &str, user_id: &str) -> bool {
        self.get_variant(experiment, user_id, None) == variant
    }

    /// Resolves a variant and records the decision on `context`.
    pub fn resolve(
        &self,
        context: &mut RequestContext,
        experiment: &str,
        user_id: &str,
    ) -> Decision {
        let decision = match self.try_resolve(context, experiment, user_id) {
            Ok((decision, _)) => decision,
            Err(err) => {
                warn!(experiment, user_id, error = %err, "variant resolution degraded to fallback");
                let reason = if err.is_unavailable() {
                    FallbackReason::StoreUnavailable
                } else {
                    FallbackReason::StoreError
                };
                self.fallback(experiment, reason)
            }
        };

        debug!(
            experiment,
            user_id,
            variant = %decision.variant,
            source = ?decision.source,
            "variant resolved"
        );
        context.record(decision.clone());
        decision
    }

    /// Records one occurrence of `event_name` for the user's current variant.
    /// Repeated events increment a counter on a single row.
    pub fn track(
        &self,
        experiment: &str,
        user_id: &str,
        event_name: &str,
        properties: &Properties,
    ) -> TrackOutcome {
        match self.try_track(experiment, user_id, event_name, properties) {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(experiment, user_id, event_name, error = %err, "event dropped");
                let reason = if err.is_unavailable() {
                    DropReason::StoreUnavailable
                } else {
                    DropReason::StoreError
                };
                TrackOutcome::Dropped { reason }
            }
        }
    }

    pub fn track_conversion(
        &self,
        experiment: &str,
        user_id: &str,
        properties: &Properties,
    ) -> TrackOutcome {
        let event_name = self.config.conversion_event.clone();
        self.track(experiment, user_id, &event_name, properties)
    }

    /// Per-variant assignments, converting users and conversion rates.
    ///
    /// # Errors
    /// Returns [`ExperimentError::NotFound`] for unknown experiments and
    /// store errors unchanged.
    pub fn results(&self, experiment: &str) -> Result<ExperimentResults, ExperimentError> {
        let experiment = self.require(experiment)?;
        self.results_for(&experiment)
    }

    /// Two-proportion z-test of `variant` against control.
    ///
    /// # Errors
    /// Returns [`ExperimentError::NotFound`] for unknown experiments and
    /// store errors unchanged.
    pub fn significance(
        &self,
        experiment: &str,
        variant: &str,
    ) -> Result<SignificanceReport, ExperimentError> {
        let experiment = self.require(experiment)?;
        let results = self.results_for(&experiment)?;
        Ok(significance(&experiment, &results, variant))
    }

    /// Occurrence and distinct-user counts for every tracked event name.
    ///
    /// # Errors
    /// Returns [`ExperimentError::NotFound`] for unknown experiments and
    /// store errors unchanged.
    pub fn event_summary(&self, experiment: &str) -> Result<Vec<EventSummary>, ExperimentError> {
        let experiment = self.require(experiment)?;
        Ok(self.store.event_summary(experiment.id)?)
    }

    /// # Errors
    /// Returns store errors unchanged.
    pub fn user_assignments(&self, user_id: &str) -> Result<Vec<UserAssignment>, ExperimentError> {
        Ok(self.store.user_assignments(user_id)?)
    }

    /// # Errors
    /// Returns store errors unchanged.
    pub fn list_experiments(&self) -> Result<Vec<Experiment>, ExperimentError> {
        Ok(self.store.list_experiments()?)
    }

    /// Read-through cached lookup.
    ///
    /// # Errors
    /// Returns [`ExperimentError::NotFound`] for unknown experiments and
    /// store errors unchanged.
    pub fn experiment(&self, name: &str) -> Result<Experiment, ExperimentError> {
        self.require(name)
    }

    /// # Errors
    /// Returns [`ExperimentError::InvalidDefinition`] for invalid drafts and
    /// [`ExperimentError::Conflict`] when the name is taken.
    pub fn create_experiment(&self, draft: ExperimentDraft) -> Result<Experiment, ExperimentError> {
        let experiment = Experiment::from_draft(draft, now_utc());
        experiment.validate()?;

        self.store.insert_experiment(&experiment).map_err(|err| match err {
            StoreError::Conflict(_) => ExperimentError::Conflict(experiment.name.clone()),
            other => other.into(),
        })?;
        self.invalidate(&experiment.name);

        info!(experiment = %experiment.name, id = %experiment.id, "experiment created");
        Ok(experiment)
    }

    /// # Errors
    /// Returns [`ExperimentError::NotFound`] for unknown experiments and
    /// [`ExperimentError::InvalidDefinition`] when the patched definition is
    /// invalid.
    pub fn update_experiment(
        &self,
        name: &str,
        patch: ExperimentPatch,
    ) -> Result<Experiment, ExperimentError> {
        let mut experiment = self.require_fresh(name)?;
        experiment.apply_patch(patch, now_utc());
        self.persist_update(experiment)
    }

    /// # Errors
    /// Returns [`ExperimentError::NotFound`] for unknown experiments.
    pub fn delete_experiment(&self, name: &str) -> Result<(), ExperimentError> {
        let experiment = self.require_fresh(name)?;
        let deleted = self.store.delete_experiment(experiment.id);
        self.invalidate(name);
        if !deleted? {
            return Err(ExperimentError::NotFound(name.to_string()));
        }

        info!(experiment = name, "experiment deleted");
        Ok(())
    }

    /// # Errors
    /// Returns [`ExperimentError::NotFound`] for unknown experiments.
    pub fn toggle_active(&self, name: &str) -> Result<Experiment, ExperimentError> {
        let mut experiment = self.require_fresh(name)?;
        experiment.is_active = !experiment.is_active;
        experiment.updated_at = now_utc();
        self.persist_update(experiment)
    }

    /// # Errors
    /// Returns [`ExperimentError::NotFound`] for unknown experiments.
    pub fn set_status(
        &self,
        name: &str,
        status: ExperimentStatus,
    ) -> Result<Experiment, ExperimentError> {
        let mut experiment = self.require_fresh(name)?;
        experiment.status = status;
        experiment.updated_at = now_utc();
        self.persist_update(experiment)
    }

    /// Drops every assignment and event of the experiment.
    ///
    /// # Errors
    /// Returns [`ExperimentError::NotFound`] for unknown experiments.
    pub fn reset_experiment(&self, name: &str) -> Result<ResetReport, ExperimentError> {
        let experiment = self.require_fresh(name)?;
        let report = self.store.reset_experiment(experiment.id);
        self.invalidate(name);
        let report = report?;

        info!(
            experiment = name,
            assignments_removed = report.assignments_removed,
            events_removed = report.events_removed,
            "experiment reset"
        );
        Ok(report)
    }

    /// Clears one experiment's entries, or the whole cache when `None`.
    pub fn clear_cache(&self, experiment: Option<&str>) {
        match experiment {
            Some(name) => self.invalidate(name),
            None => self.cache.flush(),
        }
    }

    fn try_resolve(
        &self,
        context: &RequestContext,
        name: &str,
        user_id: &str,
    ) -> Result<(Decision, Option<Experiment>), StoreError> {
        let experiment = self.lookup(name)?;

        if let Some(requested) = context.override_for(name) {
            match &experiment {
                Some(found) if found.has_variant(requested) => {
                    let decision = self.decision(name, requested, DecisionSource::Override);
                    return Ok((decision, experiment));
                }
                _ => debug!(experiment = name, requested, "ignoring unknown override variant"),
            }
        }

        let Some(experiment) = experiment else {
            return Ok((self.fallback(name, FallbackReason::ExperimentNotFound), None));
        };

        if !experiment.is_live_at(now_utc()) {
            let decision = self.fallback(name, FallbackReason::NotLive);
            return Ok((decision, Some(experiment)));
        }

        let cache_key = variant_key(name, user_id);
        if let Some(variant) = self.cache.get(&cache_key).and_then(|value| {
            value.as_str().map(str::to_string)
        }) {
            let decision = self.decision(name, &variant, DecisionSource::Cached);
            return Ok((decision, Some(experiment)));
        }

        if let Some(existing) = self.store.find_assignment(experiment.id, user_id)? {
            self.cache.set(&cache_key, existing.variant.clone().into());
            let decision = self.decision(name, &existing.variant, DecisionSource::Existing);
            return Ok((decision, Some(experiment)));
        }

        if self.config.enforce_traffic_allocation
            && !within_traffic_allocation(name, user_id, experiment.traffic_allocation)
        {
            let decision = self.fallback(name, FallbackReason::OutsideTrafficAllocation);
            return Ok((decision, Some(experiment)));
        }

        let counts = self.store.assignment_counts(experiment.id)?;
        let choice = allocate(
            name,
            &experiment.variants,
            &counts,
            user_id,
            &self.config.adaptive_policy(),
        );

        let persisted = self.store.insert_assignment(&Assignment {
            experiment_id: experiment.id,
            user_id: user_id.to_string(),
            variant: choice.variant.clone(),
            assigned_at: now_utc(),
        })?;
        self.cache.set(&cache_key, persisted.variant.clone().into());

        let source = if persisted.variant == choice.variant {
            info!(
                experiment = name,
                user_id,
                variant = %persisted.variant,
                allocation = ?choice.allocation,
                "new assignment"
            );
            DecisionSource::Assigned(choice.allocation)
        } else {
            debug!(experiment = name, user_id, "lost assignment race; using persisted row");
            DecisionSource::Existing
        };

        Ok((self.decision(name, &persisted.variant, source), Some(experiment)))
    }

    fn try_track(
        &self,
        name: &str,
        user_id: &str,
        event_name: &str,
        properties: &Properties,
    ) -> Result<TrackOutcome, StoreError> {
        if event_name.trim().is_empty() {
            return Ok(TrackOutcome::Dropped {
                reason: DropReason::InvalidEventName,
            });
        }

        let (decision, experiment) = self.try_resolve(&RequestContext::new(), name, user_id)?;
        let Some(experiment) = experiment else {
            debug!(experiment = name, event_name, "event for unknown experiment dropped");
            return Ok(TrackOutcome::Dropped {
                reason: DropReason::ExperimentNotFound,
            });
        };

        // Events always land on the stored assignment, live or not.
        let variant = match decision.source {
            DecisionSource::Fallback(_) => self
                .store
                .find_assignment(experiment.id, user_id)?
                .map_or(decision.variant, |assignment| assignment.variant),
            _ => decision.variant,
        };

        let event = self.store.upsert_event(&EventUpsert {
            key: EventKey {
                experiment_id: experiment.id,
                user_id: user_id.to_string(),
                event_name: event_name.to_string(),
                variant,
            },
            properties: properties.clone(),
            occurred_at: now_utc(),
        })?;

        debug!(
            experiment = name,
            user_id,
            event_name,
            count = event.count,
            "event recorded"
        );
        Ok(TrackOutcome::Recorded {
            variant: event.variant,
            count: event.count,
        })
    }

    fn results_for(&self, experiment: &Experiment) -> Result<ExperimentResults, ExperimentError> {
        let assignments = self.store.assignment_counts(experiment.id)?;
        let conversions = self
            .store
            .distinct_event_users(experiment.id, &self.config.conversion_event)?;
        Ok(summarize(
            experiment,
            &assignments,
            &conversions,
            experiment.is_live_at(now_utc()),
        ))
    }

    fn persist_update(&self, experiment: Experiment) -> Result<Experiment, ExperimentError> {
        experiment.validate()?;
        let updated = self.store.update_experiment(&experiment);
        self.invalidate(&experiment.name);
        updated?;

        info!(
            experiment = %experiment.name,
            status = %experiment.status,
            is_active = experiment.is_active,
            "experiment updated"
        );
        Ok(experiment)
    }

    fn lookup(&self, name: &str) -> Result<Option<Experiment>, StoreError> {
        let key = experiment_key(name);
        if let Some(value) = self.cache.get(&key) {
            match serde_json::from_value::<Experiment>(value) {
                Ok(experiment) => return Ok(Some(experiment)),
                Err(err) => {
                    warn!(experiment = name, error = %err, "discarding undecodable cache entry");
                    self.cache.delete(&key);
                }
            }
        }

        let experiment = self.store.find_experiment(name)?;
        if let Some(found) = &experiment {
            match serde_json::to_value(found) {
                Ok(value) => self.cache.set(&key, value),
                Err(err) => warn!(experiment = name, error = %err, "experiment not cached"),
            }
        }
        Ok(experiment)
    }

    fn require(&self, name: &str) -> Result<Experiment, ExperimentError> {
        self.lookup(name)?
            .ok_or_else(|| ExperimentError::NotFound(name.to_string()))
    }

    fn require_fresh(&self, name: &str) -> Result<Experiment, ExperimentError> {
        self.store
            .find_experiment(name)?
            .ok_or_else(|| ExperimentError::NotFound(name.to_string()))
    }

    fn invalidate(&self, name: &str) {
        self.cache.delete(&experiment_key(name));
        let removed = self.cache.delete_prefix(&variant_prefix(name));
        debug!(experiment = name, variant_entries = removed, "cache invalidated");
    }

    fn decision(&self, name: &str, variant: &str, source: DecisionSource) -> Decision {
        Decision {
            experiment: name.to_string(),
            variant: variant.to_string(),
            source,
        }
    }

    fn fallback(&self, name: &str, reason: FallbackReason) -> Decision {
        self.decision(name, &self.config.fallback_variant, DecisionSource::Fallback(reason))
    }
}
