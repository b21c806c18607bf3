use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use ulid::Ulid;

use crate::{Assignment, Event, Experiment, Properties, StoreError};

/// Uniqueness key of an aggregated event row.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct EventKey {
    pub experiment_id: Ulid,
    pub user_id: String,
    pub event_name: String,
    pub variant: String,
}

/// Insert-or-increment request for one event occurrence.
#[derive(Debug, Clone, PartialEq)]
pub struct EventUpsert {
    pub key: EventKey,
    pub properties: Properties,
    pub occurred_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct EventSummary {
    pub event_name: String,
    pub variant: String,
    pub users: u64,
    pub occurrences: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct UserAssignment {
    pub experiment: String,
    pub assignment: Assignment,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Default)]
pub struct ResetReport {
    pub assignments_removed: u64,
    pub events_removed: u64,
}

/// Persistence contract for experiments, assignments and events.
///
/// Implementations MUST enforce uniqueness of `(experiment_id, user_id)` for
/// assignments and of [`EventKey`] for events, and MUST report a busy or
/// unreachable backend as [`StoreError::Unavailable`].
pub trait ExperimentStore {
    #[allow(clippy::missing_errors_doc)]
    fn insert_experiment(&self, experiment: &Experiment) -> Result<(), StoreError>;

    #[allow(clippy::missing_errors_doc)]
    fn update_experiment(&self, experiment: &Experiment) -> Result<(), StoreError>;

    /// Removes the experiment with its assignments and events.
    #[allow(clippy::missing_errors_doc)]
    fn delete_experiment(&self, experiment_id: Ulid) -> Result<bool, StoreError>;

    #[allow(clippy::missing_errors_doc)]
    fn find_experiment(&self, name: &str) -> Result<Option<Experiment>, StoreError>;

    #[allow(clippy::missing_errors_doc)]
    fn list_experiments(&self) -> Result<Vec<Experiment>, StoreError>;

    #[allow(clippy::missing_errors_doc)]
    fn find_assignment(
        &self,
        experiment_id: Ulid,
        user_id: &str,
    ) -> Result<Option<Assignment>, StoreError>;

    /// Inserts the assignment unless one already exists and returns the
    /// persisted row, which is the concurrent winner when a race occurred.
    #[allow(clippy::missing_errors_doc)]
    fn insert_assignment(&self, assignment: &Assignment) -> Result<Assignment, StoreError>;

    /// Assignment rows per variant, including variants no longer declared.
    #[allow(clippy::missing_errors_doc)]
    fn assignment_counts(&self, experiment_id: Ulid) -> Result<BTreeMap<String, u64>, StoreError>;

    #[allow(clippy::missing_errors_doc)]
    fn user_assignments(&self, user_id: &str) -> Result<Vec<UserAssignment>, StoreError>;

    /// Atomically inserts a row with `count = 1` or merges properties and
    /// increments the existing row.
    #[allow(clippy::missing_errors_doc)]
    fn upsert_event(&self, upsert: &EventUpsert) -> Result<Event, StoreError>;

    #[allow(clippy::missing_errors_doc)]
    fn find_event(&self, key: &EventKey) -> Result<Option<Event>, StoreError>;

    /// Distinct users per variant with at least one `event_name` row recorded
    /// under their own assignment variant. Unassigned users are not counted.
    #[allow(clippy::missing_errors_doc)]
    fn distinct_event_users(
        &self,
        experiment_id: Ulid,
        event_name: &str,
    ) -> Result<BTreeMap<String, u64>, StoreError>;

    #[allow(clippy::missing_errors_doc)]
    fn event_summary(&self, experiment_id: Ulid) -> Result<Vec<EventSummary>, StoreError>;

    #[allow(clippy::missing_errors_doc)]
    fn reset_experiment(&self, experiment_id: Ulid) -> Result<ResetReport, StoreError>;
}
