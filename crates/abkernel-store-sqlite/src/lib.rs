#![allow(clippy::missing_errors_doc)]
#![allow(clippy::uninlined_format_args)]

use std::collections::BTreeMap;
use std::path::Path;

use abkernel_core::config::StoreConfig;
use abkernel_core::{
    format_rfc3339, merge_properties, now_utc, parse_rfc3339_utc, Assignment, Event, EventKey,
    EventSummary, EventUpsert, Experiment, ExperimentError, ExperimentStatus, ExperimentStore,
    Properties, ResetReport, StoreError, UserAssignment, Variant,
};
use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Transaction, TransactionBehavior};
use serde_json::Value;
use tracing::debug;
use ulid::Ulid;

const SCHEMA_MIGRATION_VERSION: i64 = 1;

const SCHEMA_V1: &str = r"
CREATE TABLE IF NOT EXISTS ab_experiments (
  experiment_id TEXT PRIMARY KEY,
  name TEXT NOT NULL UNIQUE,
  description TEXT NOT NULL DEFAULT '',
  variants_json TEXT NOT NULL,
  is_active INTEGER NOT NULL DEFAULT 0 CHECK (is_active IN (0, 1)),
  status TEXT NOT NULL CHECK (status IN ('draft', 'running', 'paused', 'completed')),
  start_date TEXT,
  end_date TEXT,
  traffic_allocation INTEGER NOT NULL DEFAULT 100 CHECK (traffic_allocation BETWEEN 0 AND 100),
  minimum_sample_size INTEGER NOT NULL DEFAULT 100 CHECK (minimum_sample_size >= 1),
  confidence_level REAL NOT NULL DEFAULT 95.0 CHECK (confidence_level > 0.0 AND confidence_level < 100.0),
  target_applications_json TEXT NOT NULL DEFAULT '[]',
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS ab_assignments (
  assignment_seq INTEGER PRIMARY KEY AUTOINCREMENT,
  experiment_id TEXT NOT NULL,
  user_id TEXT NOT NULL,
  variant TEXT NOT NULL,
  assigned_at TEXT NOT NULL,
  UNIQUE (experiment_id, user_id),
  FOREIGN KEY (experiment_id) REFERENCES ab_experiments(experiment_id) ON DELETE CASCADE
);

CREATE TRIGGER IF NOT EXISTS trg_ab_assignments_no_update
BEFORE UPDATE ON ab_assignments
BEGIN
  SELECT RAISE(FAIL, 'ab_assignments are sticky');
END;

CREATE INDEX IF NOT EXISTS idx_ab_assignments_experiment_variant
  ON ab_assignments(experiment_id, variant);
CREATE INDEX IF NOT EXISTS idx_ab_assignments_user
  ON ab_assignments(user_id);

CREATE TABLE IF NOT EXISTS ab_events (
  event_id INTEGER PRIMARY KEY AUTOINCREMENT,
  experiment_id TEXT NOT NULL,
  user_id TEXT NOT NULL,
  event_name TEXT NOT NULL,
  variant TEXT NOT NULL,
  count INTEGER NOT NULL DEFAULT 1 CHECK (count >= 1),
  properties_json TEXT NOT NULL DEFAULT '{}',
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  UNIQUE (experiment_id, user_id, event_name, variant),
  FOREIGN KEY (experiment_id) REFERENCES ab_experiments(experiment_id) ON DELETE CASCADE
);

CREATE TRIGGER IF NOT EXISTS trg_ab_events_count_monotonic
BEFORE UPDATE OF count ON ab_events
WHEN NEW.count < OLD.count
BEGIN
  SELECT RAISE(FAIL, 'ab_events.count is monotonic');
END;

CREATE INDEX IF NOT EXISTS idx_ab_events_experiment_name_variant
  ON ab_events(experiment_id, event_name, variant);
";

const EXPERIMENT_COLUMNS: &str = "experiment_id, name, description, variants_json, is_active,
    status, start_date, end_date, traffic_allocation, minimum_sample_size,
    confidence_level, target_applications_json, created_at, updated_at";

const EVENT_COLUMNS: &str = "event_id, experiment_id, user_id, event_name, variant, count,
    properties_json, created_at, updated_at";

pub struct SqliteExperimentStore {
    conn: Connection,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum IntegrityIssueSeverity {
    Warning,
    Error,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct IntegrityIssue {
    pub code: String,
    pub severity: IntegrityIssueSeverity,
    pub message: String,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub contract_version: String,
    pub healthy: bool,
    pub experiments: u64,
    pub assignments: u64,
    pub events: u64,
    pub issues: Vec<IntegrityIssue>,
}

impl SqliteExperimentStore {
    pub fn open(path: &Path, config: StoreConfig) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.busy_timeout(config.busy_timeout())
            .context("failed to configure sqlite busy timeout")?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    pub fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .context("failed to ensure schema_migrations exists")?;

        self.conn
            .execute_batch(SCHEMA_V1)
            .context("failed to apply experiment schema")?;

        ensure_unique_index_on_columns(&self.conn, "ab_experiments", &["name"])?;
        ensure_unique_index_on_columns(&self.conn, "ab_assignments", &["experiment_id", "user_id"])?;
        ensure_unique_index_on_columns(
            &self.conn,
            "ab_events",
            &["experiment_id", "user_id", "event_name", "variant"],
        )?;

        let now = format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![SCHEMA_MIGRATION_VERSION, now],
            )
            .context("failed to register experiment schema migration")?;

        debug!(version = SCHEMA_MIGRATION_VERSION, "experiment schema ready");
        Ok(())
    }

    /// Cross-table consistency report: every stored definition decodes and
    /// validates, and every event row agrees with its user's assignment.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let mut issues = Vec::new();

        let experiments = self
            .list_experiments()
            .map_err(|err| anyhow!("failed to load experiments: {err}"))?;
        for experiment in &experiments {
            if let Err(err) = experiment.validate() {
                issues.push(IntegrityIssue {
                    code: "invalid_definition".to_string(),
                    severity: IntegrityIssueSeverity::Error,
                    message: format!("{}: {err}", experiment.name),
                });
            }
        }

        let mismatched = count_query(
            &self.conn,
            "SELECT COUNT(*)
             FROM ab_events events
             JOIN ab_assignments assignments
               ON assignments.experiment_id = events.experiment_id
              AND assignments.user_id = events.user_id
             WHERE assignments.variant <> events.variant",
        )?;
        if mismatched > 0 {
            issues.push(IntegrityIssue {
                code: "event_variant_mismatch".to_string(),
                severity: IntegrityIssueSeverity::Error,
                message: format!(
                    "{mismatched} event rows disagree with the user's assignment variant"
                ),
            });
        }

        let unassigned = count_query(
            &self.conn,
            "SELECT COUNT(*)
             FROM ab_events events
             LEFT JOIN ab_assignments assignments
               ON assignments.experiment_id = events.experiment_id
              AND assignments.user_id = events.user_id
             WHERE assignments.user_id IS NULL",
        )?;
        if unassigned > 0 {
            issues.push(IntegrityIssue {
                code: "events_without_assignment".to_string(),
                severity: IntegrityIssueSeverity::Warning,
                message: format!(
                    "{unassigned} event rows were recorded under the fallback variant"
                ),
            });
        }

        let healthy = !issues
            .iter()
            .any(|issue| issue.severity == IntegrityIssueSeverity::Error);

        Ok(IntegrityReport {
            contract_version: "integrity_check.v1".to_string(),
            healthy,
            experiments: u64::try_from(experiments.len())
                .with_context(|| format!("invalid experiment count: {}", experiments.len()))?,
            assignments: count_query(&self.conn, "SELECT COUNT(*) FROM ab_assignments")?,
            events: count_query(&self.conn, "SELECT COUNT(*) FROM ab_events")?,
            issues,
        })
    }

    fn query_event(conn: &Connection, key: &EventKey) -> Result<Option<Event>, StoreError> {
        conn.query_row(
            &format!(
                "SELECT {EVENT_COLUMNS}
                 FROM ab_events
                 WHERE experiment_id = ?1 AND user_id = ?2 AND event_name = ?3 AND variant = ?4"
            ),
            params![
                key.experiment_id.to_string(),
                key.user_id,
                key.event_name,
                key.variant
            ],
            parse_event_row,
        )
        .optional()
        .map_err(map_sql_error)
    }

    #[cfg(test)]
    fn connection(&self) -> &Connection {
        &self.conn
    }
}

impl ExperimentStore for SqliteExperimentStore {
    fn insert_experiment(&self, experiment: &Experiment) -> Result<(), StoreError> {
        let row = ExperimentRow::encode(experiment)?;
        self.conn
            .execute(
                &format!(
                    "INSERT INTO ab_experiments({EXPERIMENT_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)"
                ),
                params![
                    row.experiment_id,
                    experiment.name,
                    experiment.description,
                    row.variants_json,
                    bool_to_sql(experiment.is_active),
                    experiment.status.as_str(),
                    row.start_date,
                    row.end_date,
                    i64::from(experiment.traffic_allocation),
                    i64::from(experiment.minimum_sample_size),
                    experiment.confidence_level,
                    row.target_applications_json,
                    row.created_at,
                    row.updated_at,
                ],
            )
            .map_err(map_sql_error)?;
        Ok(())
    }

    fn update_experiment(&self, experiment: &Experiment) -> Result<(), StoreError> {
        let row = ExperimentRow::encode(experiment)?;
        let changed = self
            .conn
            .execute(
                "UPDATE ab_experiments SET
                    name = ?2,
                    description = ?3,
                    variants_json = ?4,
                    is_active = ?5,
                    status = ?6,
                    start_date = ?7,
                    end_date = ?8,
                    traffic_allocation = ?9,
                    minimum_sample_size = ?10,
                    confidence_level = ?11,
                    target_applications_json = ?12,
                    updated_at = ?13
                 WHERE experiment_id = ?1",
                params![
                    row.experiment_id,
                    experiment.name,
                    experiment.description,
                    row.variants_json,
                    bool_to_sql(experiment.is_active),
                    experiment.status.as_str(),
                    row.start_date,
                    row.end_date,
                    i64::from(experiment.traffic_allocation),
                    i64::from(experiment.minimum_sample_size),
                    experiment.confidence_level,
                    row.target_applications_json,
                    row.updated_at,
                ],
            )
            .map_err(map_sql_error)?;

        if changed == 0 {
            return Err(StoreError::Backend(format!(
                "experiment {} vanished during update",
                experiment.name
            )));
        }
        Ok(())
    }

    fn delete_experiment(&self, experiment_id: Ulid) -> Result<bool, StoreError> {
        let deleted = self
            .conn
            .execute(
                "DELETE FROM ab_experiments WHERE experiment_id = ?1",
                params![experiment_id.to_string()],
            )
            .map_err(map_sql_error)?;
        Ok(deleted > 0)
    }

    fn find_experiment(&self, name: &str) -> Result<Option<Experiment>, StoreError> {
        self.conn
            .query_row(
                &format!("SELECT {EXPERIMENT_COLUMNS} FROM ab_experiments WHERE name = ?1"),
                params![name],
                parse_experiment_row,
            )
            .optional()
            .map_err(map_sql_error)
    }

    fn list_experiments(&self) -> Result<Vec<Experiment>, StoreError> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {EXPERIMENT_COLUMNS} FROM ab_experiments ORDER BY name ASC"
            ))
            .map_err(map_sql_error)?;
        let rows = stmt
            .query_map([], parse_experiment_row)
            .map_err(map_sql_error)?;
        collect_rows(rows)
    }

    fn find_assignment(
        &self,
        experiment_id: Ulid,
        user_id: &str,
    ) -> Result<Option<Assignment>, StoreError> {
        self.conn
            .query_row(
                "SELECT experiment_id, user_id, variant, assigned_at
                 FROM ab_assignments
                 WHERE experiment_id = ?1 AND user_id = ?2",
                params![experiment_id.to_string(), user_id],
                parse_assignment_row,
            )
            .optional()
            .map_err(map_sql_error)
    }

    fn insert_assignment(&self, assignment: &Assignment) -> Result<Assignment, StoreError> {
        let assigned_at =
            format_rfc3339(assignment.assigned_at).map_err(|err| StoreError::Backend(err.to_string()))?;

        self.conn
            .execute(
                "INSERT INTO ab_assignments(experiment_id, user_id, variant, assigned_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(experiment_id, user_id) DO NOTHING",
                params![
                    assignment.experiment_id.to_string(),
                    assignment.user_id,
                    assignment.variant,
                    assigned_at,
                ],
            )
            .map_err(map_sql_error)?;

        self.find_assignment(assignment.experiment_id, &assignment.user_id)?
            .ok_or_else(|| {
                StoreError::Backend(format!(
                    "assignment for {} missing after insert",
                    assignment.user_id
                ))
            })
    }

    fn assignment_counts(&self, experiment_id: Ulid) -> Result<BTreeMap<String, u64>, StoreError> {
        grouped_counts(
            &self.conn,
            "SELECT variant, COUNT(*)
             FROM ab_assignments
             WHERE experiment_id = ?1
             GROUP BY variant",
            params![experiment_id.to_string()],
        )
    }

    fn user_assignments(&self, user_id: &str) -> Result<Vec<UserAssignment>, StoreError> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT a.experiment_id, a.user_id, a.variant, a.assigned_at, e.name
                 FROM ab_assignments a
                 JOIN ab_experiments e ON e.experiment_id = a.experiment_id
                 WHERE a.user_id = ?1
                 ORDER BY a.assignment_seq ASC",
            )
            .map_err(map_sql_error)?;
        let rows = stmt
            .query_map(params![user_id], |row| {
                Ok(UserAssignment {
                    assignment: parse_assignment_row(row)?,
                    experiment: row.get(4)?,
                })
            })
            .map_err(map_sql_error)?;
        collect_rows(rows)
    }

    fn upsert_event(&self, upsert: &EventUpsert) -> Result<Event, StoreError> {
        let key = &upsert.key;
        let occurred_at =
            format_rfc3339(upsert.occurred_at).map_err(|err| StoreError::Backend(err.to_string()))?;

        // Write lock is taken before the read so increments of one key serialize.
        let tx = Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)
            .map_err(map_sql_error)?;

        match Self::query_event(&tx, key)? {
            Some(existing) => {
                let merged = merge_properties(&existing.properties, &upsert.properties);
                tx.execute(
                    "UPDATE ab_events
                     SET count = count + 1, properties_json = ?2, updated_at = ?3
                     WHERE event_id = ?1",
                    params![existing.event_id, encode_json(&merged)?, occurred_at],
                )
                .map_err(map_sql_error)?;
            }
            None => {
                tx.execute(
                    "INSERT INTO ab_events(
                        experiment_id, user_id, event_name, variant, count,
                        properties_json, created_at, updated_at
                     ) VALUES (?1, ?2, ?3, ?4, 1, ?5, ?6, ?6)",
                    params![
                        key.experiment_id.to_string(),
                        key.user_id,
                        key.event_name,
                        key.variant,
                        encode_json(&upsert.properties)?,
                        occurred_at,
                    ],
                )
                .map_err(map_sql_error)?;
            }
        }

        let event = Self::query_event(&tx, key)?
            .ok_or_else(|| StoreError::Backend("event row missing after upsert".to_string()))?;
        tx.commit().map_err(map_sql_error)?;
        Ok(event)
    }

    fn find_event(&self, key: &EventKey) -> Result<Option<Event>, StoreError> {
        Self::query_event(&self.conn, key)
    }

    fn distinct_event_users(
        &self,
        experiment_id: Ulid,
        event_name: &str,
    ) -> Result<BTreeMap<String, u64>, StoreError> {
        grouped_counts(
            &self.conn,
            "SELECT events.variant, COUNT(DISTINCT events.user_id)
             FROM ab_events events
             JOIN ab_assignments assignments
               ON assignments.experiment_id = events.experiment_id
              AND assignments.user_id = events.user_id
              AND assignments.variant = events.variant
             WHERE events.experiment_id = ?1 AND events.event_name = ?2
             GROUP BY events.variant",
            params![experiment_id.to_string(), event_name],
        )
    }

    fn event_summary(&self, experiment_id: Ulid) -> Result<Vec<EventSummary>, StoreError> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT event_name, variant, COUNT(DISTINCT user_id), SUM(count)
                 FROM ab_events
                 WHERE experiment_id = ?1
                 GROUP BY event_name, variant
                 ORDER BY event_name ASC, variant ASC",
            )
            .map_err(map_sql_error)?;
        let rows = stmt
            .query_map(params![experiment_id.to_string()], |row| {
                Ok(EventSummary {
                    event_name: row.get(0)?,
                    variant: row.get(1)?,
                    users: sql_to_u64(row.get(2)?, 2)?,
                    occurrences: sql_to_u64(row.get(3)?, 3)?,
                })
            })
            .map_err(map_sql_error)?;
        collect_rows(rows)
    }

    fn reset_experiment(&self, experiment_id: Ulid) -> Result<ResetReport, StoreError> {
        let id = experiment_id.to_string();
        let tx = Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)
            .map_err(map_sql_error)?;
        let events_removed = tx
            .execute("DELETE FROM ab_events WHERE experiment_id = ?1", params![id])
            .map_err(map_sql_error)?;
        let assignments_removed = tx
            .execute("DELETE FROM ab_assignments WHERE experiment_id = ?1", params![id])
            .map_err(map_sql_error)?;
        tx.commit().map_err(map_sql_error)?;

        Ok(ResetReport {
            assignments_removed: removed_rows(assignments_removed)?,
            events_removed: removed_rows(events_removed)?,
        })
    }
}

struct ExperimentRow {
    experiment_id: String,
    variants_json: String,
    start_date: Option<String>,
    end_date: Option<String>,
    target_applications_json: String,
    created_at: String,
    updated_at: String,
}

impl ExperimentRow {
    fn encode(experiment: &Experiment) -> Result<Self, StoreError> {
        let stamp = |value| format_rfc3339(value).map_err(|err| StoreError::Backend(err.to_string()));
        Ok(Self {
            experiment_id: experiment.id.to_string(),
            variants_json: serde_json::to_string(&experiment.variants)
                .map_err(|err| StoreError::Backend(format!("failed to encode variants: {err}")))?,
            start_date: experiment.start_date.map(stamp).transpose()?,
            end_date: experiment.end_date.map(stamp).transpose()?,
            target_applications_json: serde_json::to_string(&experiment.target_applications)
                .map_err(|err| {
                    StoreError::Backend(format!("failed to encode target applications: {err}"))
                })?,
            created_at: stamp(experiment.created_at)?,
            updated_at: stamp(experiment.updated_at)?,
        })
    }
}

fn parse_experiment_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Experiment> {
    let variants: Vec<Variant> = serde_json::from_str(&row.get::<_, String>(3)?)
        .map_err(|err| invalid_data(3, format!("invalid variants_json: {err}")))?;
    let status_raw: String = row.get(5)?;
    let status = ExperimentStatus::parse(&status_raw)
        .ok_or_else(|| invalid_data(5, format!("invalid status: {status_raw}")))?;
    let target_applications: Vec<String> = serde_json::from_str(&row.get::<_, String>(11)?)
        .map_err(|err| invalid_data(11, format!("invalid target_applications_json: {err}")))?;

    let traffic_allocation_i64: i64 = row.get(8)?;
    let minimum_sample_size_i64: i64 = row.get(9)?;

    Ok(Experiment {
        id: parse_ulid(&row.get::<_, String>(0)?)?,
        name: row.get(1)?,
        description: row.get(2)?,
        variants,
        is_active: row.get::<_, i64>(4)? == 1,
        status,
        start_date: parse_optional_timestamp(row.get(6)?)?,
        end_date: parse_optional_timestamp(row.get(7)?)?,
        traffic_allocation: u8::try_from(traffic_allocation_i64).map_err(|_| {
            invalid_data(8, format!("invalid traffic_allocation: {traffic_allocation_i64}"))
        })?,
        minimum_sample_size: u32::try_from(minimum_sample_size_i64).map_err(|_| {
            invalid_data(9, format!("invalid minimum_sample_size: {minimum_sample_size_i64}"))
        })?,
        confidence_level: row.get(10)?,
        target_applications,
        created_at: parse_rfc3339_utc(&row.get::<_, String>(12)?).map_err(to_sql_error)?,
        updated_at: parse_rfc3339_utc(&row.get::<_, String>(13)?).map_err(to_sql_error)?,
    })
}

fn parse_assignment_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Assignment> {
    Ok(Assignment {
        experiment_id: parse_ulid(&row.get::<_, String>(0)?)?,
        user_id: row.get(1)?,
        variant: row.get(2)?,
        assigned_at: parse_rfc3339_utc(&row.get::<_, String>(3)?).map_err(to_sql_error)?,
    })
}

fn parse_event_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Event> {
    let properties = match serde_json::from_str::<Value>(&row.get::<_, String>(6)?) {
        Ok(Value::Object(map)) => map,
        Ok(other) => return Err(invalid_data(6, format!("properties_json is not an object: {other}"))),
        Err(err) => return Err(invalid_data(6, format!("invalid properties_json: {err}"))),
    };

    Ok(Event {
        event_id: row.get(0)?,
        experiment_id: parse_ulid(&row.get::<_, String>(1)?)?,
        user_id: row.get(2)?,
        event_name: row.get(3)?,
        variant: row.get(4)?,
        count: sql_to_u64(row.get(5)?, 5)?,
        properties,
        created_at: parse_rfc3339_utc(&row.get::<_, String>(7)?).map_err(to_sql_error)?,
        updated_at: parse_rfc3339_utc(&row.get::<_, String>(8)?).map_err(to_sql_error)?,
    })
}

fn parse_ulid(raw: &str) -> rusqlite::Result<Ulid> {
    Ulid::from_string(raw).map_err(|_| invalid_data(0, format!("invalid ULID: {raw}")))
}

fn parse_optional_timestamp(raw: Option<String>) -> rusqlite::Result<Option<time::OffsetDateTime>> {
    raw.map(|value| parse_rfc3339_utc(&value).map_err(to_sql_error))
        .transpose()
}

fn sql_to_u64(value: i64, column: usize) -> rusqlite::Result<u64> {
    u64::try_from(value).map_err(|_| invalid_data(column, format!("negative count: {value}")))
}

fn removed_rows(value: usize) -> Result<u64, StoreError> {
    u64::try_from(value)
        .map_err(|_| StoreError::Backend(format!("invalid removed row count: {value}")))
}

fn encode_json(properties: &Properties) -> Result<String, StoreError> {
    serde_json::to_string(properties)
        .map_err(|err| StoreError::Backend(format!("failed to encode properties: {err}")))
}

fn bool_to_sql(value: bool) -> i64 {
    i64::from(value)
}

fn invalid_data(column: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        column,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

#[allow(clippy::needless_pass_by_value)]
fn to_sql_error(err: ExperimentError) -> rusqlite::Error {
    invalid_data(0, err.to_string())
}

/// Maps driver errors onto the store taxonomy. Lock contention that outlasts
/// the busy timeout is reported as unavailability.
#[allow(clippy::needless_pass_by_value)]
fn map_sql_error(err: rusqlite::Error) -> StoreError {
    match &err {
        rusqlite::Error::SqliteFailure(failure, _) => match failure.code {
            ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked | ErrorCode::CannotOpen => {
                StoreError::Unavailable(err.to_string())
            }
            ErrorCode::ConstraintViolation => StoreError::Conflict(err.to_string()),
            _ => StoreError::Backend(err.to_string()),
        },
        rusqlite::Error::FromSqlConversionFailure(..)
        | rusqlite::Error::InvalidColumnType(..)
        | rusqlite::Error::IntegralValueOutOfRange(..) => StoreError::Corrupt(err.to_string()),
        _ => StoreError::Backend(err.to_string()),
    }
}

fn grouped_counts(
    conn: &Connection,
    sql: &str,
    args: &[&dyn rusqlite::ToSql],
) -> Result<BTreeMap<String, u64>, StoreError> {
    let mut stmt = conn.prepare(sql).map_err(map_sql_error)?;
    let mut rows = stmt.query(args).map_err(map_sql_error)?;
    let mut counts = BTreeMap::new();
    while let Some(row) = rows.next().map_err(map_sql_error)? {
        let variant: String = row.get(0).map_err(map_sql_error)?;
        let count = sql_to_u64(row.get(1).map_err(map_sql_error)?, 1).map_err(map_sql_error)?;
        counts.insert(variant, count);
    }
    Ok(counts)
}

fn count_query(conn: &Connection, sql: &str) -> Result<u64> {
    let count = conn
        .query_row(sql, [], |row| row.get::<_, i64>(0))
        .with_context(|| format!("failed to run count query: {sql}"))?;
    u64::try_from(count).with_context(|| format!("invalid row count: {count}"))
}

fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>>,
) -> Result<Vec<T>, StoreError> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row.map_err(map_sql_error)?);
    }
    Ok(values)
}

fn ensure_unique_index_on_columns(
    conn: &Connection,
    table_name: &str,
    columns: &[&str],
) -> Result<()> {
    let mut stmt = conn
        .prepare(&format!("PRAGMA index_list({table_name})"))
        .with_context(|| format!("failed to inspect index_list for {table_name}"))?;
    let mut rows = stmt.query([])?;

    while let Some(row) = rows.next()? {
        let index_name: String = row.get(1)?;
        let is_unique: i64 = row.get(2)?;
        if is_unique != 1 {
            continue;
        }

        if index_columns(conn, &index_name)? == columns {
            return Ok(());
        }
    }

    Err(anyhow!(
        "schema check failed: expected UNIQUE({}) on {table_name}",
        columns.join(", ")
    ))
}

fn index_columns(conn: &Connection, index_name: &str) -> Result<Vec<String>> {
    let mut stmt = conn
        .prepare(&format!("PRAGMA index_info({index_name})"))
        .with_context(|| format!("failed to inspect index_info for {index_name}"))?;
    let mut rows = stmt.query([])?;

    let mut columns = Vec::new();
    while let Some(row) = rows.next()? {
        columns.push(row.get::<_, String>(2)?);
    }

    Ok(columns)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::too_many_lines, clippy::cast_possible_truncation)]

    use super::*;
    use abkernel_core::{ExperimentDraft, Variant};
    use proptest::prelude::*;
    use serde_json::json;
    use std::time::{Duration, Instant};

    fn must<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    fn fixture_store() -> SqliteExperimentStore {
        let store = must(SqliteExperimentStore::open(
            Path::new(":memory:"),
            StoreConfig::default(),
        ));
        must(store.migrate());
        store
    }

    fn fixture_experiment(name: &str) -> Experiment {
        let draft = ExperimentDraft::new(
            name,
            vec![Variant::new("control", 50), Variant::new("variant_a", 50)],
        )
        .running();
        Experiment::from_draft(draft, must(parse_rfc3339_utc("2026-02-07T12:00:00Z")))
    }

    fn seeded_store() -> (SqliteExperimentStore, Experiment) {
        let store = fixture_store();
        let experiment = fixture_experiment("checkout_flow");
        must(store.insert_experiment(&experiment));
        (store, experiment)
    }

    fn fixture_assignment(experiment: &Experiment, user_id: &str, variant: &str) -> Assignment {
        Assignment {
            experiment_id: experiment.id,
            user_id: user_id.to_string(),
            variant: variant.to_string(),
            assigned_at: must(parse_rfc3339_utc("2026-02-07T12:30:00Z")),
        }
    }

    fn fixture_upsert(experiment: &Experiment, user_id: &str, properties: Value) -> EventUpsert {
        EventUpsert {
            key: EventKey {
                experiment_id: experiment.id,
                user_id: user_id.to_string(),
                event_name: "click".to_string(),
                variant: "control".to_string(),
            },
            properties: match properties {
                Value::Object(map) => map,
                other => panic!("fixture properties must be an object, got {other}"),
            },
            occurred_at: must(parse_rfc3339_utc("2026-02-07T13:00:00Z")),
        }
    }

    #[test]
    fn experiment_round_trips_through_storage() {
        let (store, mut experiment) = seeded_store();
        experiment.target_applications = vec!["storefront".to_string()];
        experiment.end_date = Some(must(parse_rfc3339_utc("2026-06-01T00:00:00Z")));
        must(store.update_experiment(&experiment));

        let loaded = must(store.find_experiment("checkout_flow"));
        assert_eq!(loaded, Some(experiment));
    }

    #[test]
    fn duplicate_experiment_name_is_a_conflict() {
        let (store, _) = seeded_store();
        let result = store.insert_experiment(&fixture_experiment("checkout_flow"));
        assert!(matches!(result, Err(StoreError::Conflict(_))));
    }

    #[test]
    fn second_assignment_insert_returns_the_first_row() {
        let (store, experiment) = seeded_store();
        let first = must(store.insert_assignment(&fixture_assignment(&experiment, "u1", "control")));
        let second =
            must(store.insert_assignment(&fixture_assignment(&experiment, "u1", "variant_a")));

        assert_eq!(first.variant, "control");
        assert_eq!(second, first);
        assert_eq!(
            must(store.assignment_counts(experiment.id)),
            BTreeMap::from([("control".to_string(), 1)])
        );
    }

    #[test]
    fn assignments_cannot_be_rewritten() {
        let (store, experiment) = seeded_store();
        must(store.insert_assignment(&fixture_assignment(&experiment, "u1", "control")));

        let update_result = store.connection().execute(
            "UPDATE ab_assignments SET variant = 'variant_a' WHERE user_id = 'u1'",
            [],
        );
        assert!(update_result.is_err());
    }

    #[test]
    fn event_upsert_increments_and_merges_properties() {
        let (store, experiment) = seeded_store();
        let first = must(store.upsert_event(&fixture_upsert(
            &experiment,
            "u1",
            json!({"button": "buy", "page": 1}),
        )));
        assert_eq!(first.count, 1);

        must(store.upsert_event(&fixture_upsert(&experiment, "u1", json!({"page": 2}))));
        let third = must(store.upsert_event(&fixture_upsert(
            &experiment,
            "u1",
            json!({"referrer": "email"}),
        )));

        assert_eq!(third.count, 3);
        assert_eq!(third.event_id, first.event_id);
        assert_eq!(
            Value::Object(third.properties),
            json!({"button": "buy", "page": 2, "referrer": "email"})
        );

        let total_rows = must(count_query(store.connection(), "SELECT COUNT(*) FROM ab_events"));
        assert_eq!(total_rows, 1);
    }

    #[test]
    fn count_cannot_decrease() {
        let (store, experiment) = seeded_store();
        must(store.upsert_event(&fixture_upsert(&experiment, "u1", json!({}))));
        must(store.upsert_event(&fixture_upsert(&experiment, "u1", json!({}))));

        let result = store
            .connection()
            .execute("UPDATE ab_events SET count = 1 WHERE user_id = 'u1'", []);
        assert!(result.is_err());
    }

    #[test]
    fn distinct_event_users_ignores_repeat_counts() {
        let (store, experiment) = seeded_store();
        must(store.insert_assignment(&fixture_assignment(&experiment, "u1", "control")));
        must(store.insert_assignment(&fixture_assignment(&experiment, "u2", "control")));
        for _ in 0..5 {
            let mut upsert = fixture_upsert(&experiment, "u1", json!({}));
            upsert.key.event_name = "conversion".to_string();
            must(store.upsert_event(&upsert));
        }
        let mut upsert = fixture_upsert(&experiment, "u2", json!({}));
        upsert.key.event_name = "conversion".to_string();
        must(store.upsert_event(&upsert));

        let users = must(store.distinct_event_users(experiment.id, "conversion"));
        assert_eq!(users, BTreeMap::from([("control".to_string(), 2)]));

        let summary = must(store.event_summary(experiment.id));
        assert_eq!(
            summary,
            vec![EventSummary {
                event_name: "conversion".to_string(),
                variant: "control".to_string(),
                users: 2,
                occurrences: 6,
            }]
        );
    }

    #[test]
    fn distinct_event_users_only_count_rows_matching_the_assignment() {
        let (store, experiment) = seeded_store();
        must(store.insert_assignment(&fixture_assignment(&experiment, "u1", "control")));
        must(store.insert_assignment(&fixture_assignment(&experiment, "u2", "variant_a")));

        for user_id in ["u1", "u2", "u3"] {
            let mut upsert = fixture_upsert(&experiment, user_id, json!({}));
            upsert.key.event_name = "conversion".to_string();
            must(store.upsert_event(&upsert));
        }

        let users = must(store.distinct_event_users(experiment.id, "conversion"));
        assert_eq!(users, BTreeMap::from([("control".to_string(), 1)]));

        let summary = must(store.event_summary(experiment.id));
        assert_eq!(summary[0].users, 3);
    }

    #[test]
    fn delete_cascades_to_assignments_and_events() {
        let (store, experiment) = seeded_store();
        must(store.insert_assignment(&fixture_assignment(&experiment, "u1", "control")));
        must(store.upsert_event(&fixture_upsert(&experiment, "u1", json!({}))));

        assert!(must(store.delete_experiment(experiment.id)));
        assert!(!must(store.delete_experiment(experiment.id)));
        assert_eq!(
            must(count_query(store.connection(), "SELECT COUNT(*) FROM ab_assignments")),
            0
        );
        assert_eq!(
            must(count_query(store.connection(), "SELECT COUNT(*) FROM ab_events")),
            0
        );
    }

    #[test]
    fn reset_reports_removed_rows_and_keeps_definition() {
        let (store, experiment) = seeded_store();
        must(store.insert_assignment(&fixture_assignment(&experiment, "u1", "control")));
        must(store.insert_assignment(&fixture_assignment(&experiment, "u2", "variant_a")));
        must(store.upsert_event(&fixture_upsert(&experiment, "u1", json!({}))));

        let report = must(store.reset_experiment(experiment.id));
        assert_eq!(
            report,
            ResetReport {
                assignments_removed: 2,
                events_removed: 1,
            }
        );
        assert!(must(store.find_experiment("checkout_flow")).is_some());
    }

    #[test]
    fn user_assignments_list_experiment_names() {
        let store = fixture_store();
        let checkout = fixture_experiment("checkout_flow");
        let pricing = fixture_experiment("pricing_page");
        must(store.insert_experiment(&checkout));
        must(store.insert_experiment(&pricing));
        must(store.insert_assignment(&fixture_assignment(&checkout, "u1", "control")));
        must(store.insert_assignment(&fixture_assignment(&pricing, "u1", "variant_a")));

        let listed = must(store.user_assignments("u1"));
        let names: Vec<&str> = listed.iter().map(|item| item.experiment.as_str()).collect();
        assert_eq!(names, vec!["checkout_flow", "pricing_page"]);
        assert_eq!(listed[1].assignment.variant, "variant_a");
    }

    #[test]
    fn integrity_check_flags_variant_mismatch() {
        let (store, experiment) = seeded_store();
        must(store.insert_assignment(&fixture_assignment(&experiment, "u1", "variant_a")));
        must(store.upsert_event(&fixture_upsert(&experiment, "u1", json!({}))));
        must(store.upsert_event(&fixture_upsert(&experiment, "u2", json!({}))));

        let report = must(store.integrity_check());
        assert!(!report.healthy);
        let codes: Vec<&str> = report.issues.iter().map(|item| item.code.as_str()).collect();
        assert_eq!(codes, vec!["event_variant_mismatch", "events_without_assignment"]);
        assert_eq!(report.assignments, 1);
        assert_eq!(report.events, 2);
    }

    #[test]
    fn corrupt_variants_json_is_reported_clearly() {
        let (store, _) = seeded_store();
        must(store.connection().execute(
            "UPDATE ab_experiments SET variants_json = 'not-json' WHERE name = 'checkout_flow'",
            [],
        ));

        match store.find_experiment("checkout_flow") {
            Err(StoreError::Corrupt(message)) => assert!(message.contains("invalid variants_json")),
            other => panic!("expected corrupt row error, got {other:?}"),
        }
    }

    #[test]
    fn schema_contract_contains_expected_tables_and_triggers() {
        let store = fixture_store();
        let mut stmt = must(store.connection().prepare(
            "SELECT name FROM sqlite_master WHERE type IN ('table', 'trigger') ORDER BY name",
        ));
        let names: Vec<String> = must(
            must(stmt.query_map([], |row| row.get::<_, String>(0)))
                .collect::<rusqlite::Result<Vec<_>>>(),
        );
        for required in [
            "ab_assignments",
            "ab_events",
            "ab_experiments",
            "schema_migrations",
            "trg_ab_assignments_no_update",
            "trg_ab_events_count_monotonic",
        ] {
            assert!(
                names.iter().any(|name| name == required),
                "missing {required} in {names:?}"
            );
        }
    }

    #[test]
    fn migration_is_idempotent_and_preserves_existing_data() {
        let (store, experiment) = seeded_store();
        must(store.insert_assignment(&fixture_assignment(&experiment, "u1", "control")));
        must(store.migrate());
        must(store.migrate());

        assert!(must(store.find_assignment(experiment.id, "u1")).is_some());
        assert_eq!(
            must(count_query(store.connection(), "SELECT COUNT(*) FROM schema_migrations")),
            1
        );
    }

    #[test]
    fn busy_database_is_reported_as_unavailable() {
        let db_path = std::env::temp_dir().join(format!("abk-busy-{}.sqlite3", Ulid::new()));
        let holder = must(SqliteExperimentStore::open(&db_path, StoreConfig::default()));
        must(holder.migrate());
        let experiment = fixture_experiment("checkout_flow");
        must(holder.insert_experiment(&experiment));

        let contender = must(SqliteExperimentStore::open(
            &db_path,
            StoreConfig { busy_timeout_ms: 50 },
        ));

        must(holder.connection().execute_batch("BEGIN IMMEDIATE"));
        let started = Instant::now();
        let result = contender.insert_assignment(&fixture_assignment(&experiment, "u1", "control"));
        assert!(matches!(result, Err(StoreError::Unavailable(_))), "got {result:?}");
        assert!(started.elapsed() < Duration::from_secs(5));

        must(holder.connection().execute_batch("COMMIT"));
        let retried =
            must(contender.insert_assignment(&fixture_assignment(&experiment, "u1", "control")));
        assert_eq!(retried.variant, "control");

        let _ = std::fs::remove_file(&db_path);
    }

    #[test]
    fn concurrent_increments_are_not_lost() {
        let db_path = std::env::temp_dir().join(format!("abk-race-{}.sqlite3", Ulid::new()));
        let setup = must(SqliteExperimentStore::open(&db_path, StoreConfig::default()));
        must(setup.migrate());
        let experiment = fixture_experiment("checkout_flow");
        must(setup.insert_experiment(&experiment));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let path = db_path.clone();
                let experiment = experiment.clone();
                std::thread::spawn(move || {
                    let store = must(SqliteExperimentStore::open(&path, StoreConfig::default()));
                    for _ in 0..10 {
                        must(store.upsert_event(&fixture_upsert(&experiment, "u1", json!({}))));
                    }
                })
            })
            .collect();
        for handle in handles {
            if handle.join().is_err() {
                panic!("worker thread panicked");
            }
        }

        let key = fixture_upsert(&experiment, "u1", json!({})).key;
        let event = must(setup.find_event(&key));
        assert_eq!(event.map(|item| item.count), Some(40));

        let _ = std::fs::remove_file(&db_path);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        #[test]
        fn prop_upsert_count_matches_calls(calls in 1usize..30) {
            let (store, experiment) = seeded_store();
            for index in 0..calls {
                must(store.upsert_event(&fixture_upsert(&experiment, "u1", json!({"n": index}))));
            }
            let event = must(store.find_event(&fixture_upsert(&experiment, "u1", json!({})).key));
            let event = match event {
                Some(value) => value,
                None => panic!("event row missing"),
            };
            prop_assert_eq!(event.count, calls as u64);
            prop_assert_eq!(event.properties.get("n"), Some(&json!(calls - 1)));
        }
    }
}
