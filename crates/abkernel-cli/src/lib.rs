//! Embedded A/B experiment command surface.
//!
//! Hosts embed the engine through:
//! - [`run_cli`] for full parsed CLI execution.
//! - [`run_with_db`] for a single [`Command`] against a DB path.
//! - [`run_command`] for execution against an existing engine.
//!
//! Every command prints JSON on stdout (tables where a `--json` switch exists
//! and is not set). Logs go to stderr.

use std::path::{Path, PathBuf};

use abkernel_core::config::{EngineConfig, StoreConfig};
use abkernel_core::context::{Decision, RequestContext};
use abkernel_core::engine::{ExperimentEngine, TrackOutcome};
use abkernel_core::stats::{ExperimentResults, SignificanceReport};
use abkernel_core::{
    parse_rfc3339_utc, parse_variant_pair, EventSummary, Experiment, ExperimentDraft,
    ExperimentPatch, ExperimentStatus, Properties, ResetReport, UserAssignment, Variant,
};
use abkernel_store_sqlite::{IntegrityIssueSeverity, IntegrityReport, SqliteExperimentStore};
use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use tracing::debug;
use tracing_subscriber::EnvFilter;

pub type Engine = ExperimentEngine<SqliteExperimentStore>;

#[derive(Debug, Parser)]
#[command(name = "abk")]
#[command(about = "A/B experiment assignment and analysis CLI")]
pub struct Cli {
    #[arg(long, default_value = "./abkernel.sqlite3")]
    db: PathBuf,

    /// JSON engine configuration; missing keys keep their defaults.
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long, default_value_t = 5_000)]
    busy_timeout_ms: u64,

    /// Log decisions at debug level (overrides `RUST_LOG`).
    #[arg(long, short)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Experiment {
        #[command(subcommand)]
        command: Box<ExperimentCommand>,
    },
    Assign(AssignArgs),
    IsVariant(IsVariantArgs),
    Track(TrackArgs),
    Results(ResultsArgs),
    Significance(SignificanceArgs),
    Events(ExperimentNameArgs),
    User(UserArgs),
    Cache {
        #[command(subcommand)]
        command: Box<CacheCommand>,
    },
    Doctor(DoctorArgs),
}

#[derive(Debug, Subcommand)]
pub enum ExperimentCommand {
    Create(CreateArgs),
    Update(UpdateArgs),
    Delete(ExperimentNameArgs),
    Toggle(ExperimentNameArgs),
    Status(StatusArgs),
    List(ListArgs),
    Show(ExperimentNameArgs),
    Reset(ExperimentNameArgs),
}

#[derive(Debug, Args)]
pub struct CreateArgs {
    #[arg(long)]
    name: String,
    /// `<name>=<weight>`, repeated in declaration order.
    #[arg(long = "variant", required = true)]
    variants: Vec<String>,
    #[arg(long, default_value = "")]
    description: String,
    #[arg(long)]
    active: bool,
    #[arg(long, value_enum, default_value_t = StatusArg::Draft)]
    status: StatusArg,
    #[arg(long)]
    start_date: Option<String>,
    #[arg(long)]
    end_date: Option<String>,
    #[arg(long, default_value_t = 100)]
    traffic_allocation: u8,
    #[arg(long, default_value_t = 100)]
    minimum_sample_size: u32,
    #[arg(long, default_value_t = 95.0)]
    confidence_level: f64,
    #[arg(long = "target-app")]
    target_applications: Vec<String>,
}

#[derive(Debug, Args)]
pub struct UpdateArgs {
    #[arg(long)]
    name: String,
    #[arg(long = "variant")]
    variants: Vec<String>,
    #[arg(long)]
    description: Option<String>,
    #[arg(long)]
    active: Option<bool>,
    #[arg(long, value_enum)]
    status: Option<StatusArg>,
    #[arg(long, conflicts_with = "clear_start_date")]
    start_date: Option<String>,
    #[arg(long)]
    clear_start_date: bool,
    #[arg(long, conflicts_with = "clear_end_date")]
    end_date: Option<String>,
    #[arg(long)]
    clear_end_date: bool,
    #[arg(long)]
    traffic_allocation: Option<u8>,
    #[arg(long)]
    minimum_sample_size: Option<u32>,
    #[arg(long)]
    confidence_level: Option<f64>,
    #[arg(long = "target-app")]
    target_applications: Vec<String>,
}

#[derive(Debug, Args)]
pub struct ExperimentNameArgs {
    #[arg(long)]
    name: String,
}

#[derive(Debug, Args)]
pub struct StatusArgs {
    #[arg(long)]
    name: String,
    #[arg(long, value_enum)]
    set: StatusArg,
}

#[derive(Debug, Args)]
pub struct ListArgs {
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct AssignArgs {
    #[arg(long)]
    experiment: String,
    #[arg(long)]
    user: String,
    /// Debug override as `<experiment>=<variant>`; never persisted.
    #[arg(long = "override")]
    overrides: Vec<String>,
}

#[derive(Debug, Args)]
pub struct IsVariantArgs {
    #[arg(long)]
    experiment: String,
    #[arg(long)]
    variant: String,
    #[arg(long)]
    user: String,
}

#[derive(Debug, Args)]
pub struct TrackArgs {
    #[arg(long)]
    experiment: String,
    #[arg(long)]
    user: String,
    #[arg(long, default_value = "conversion")]
    event: String,
    #[arg(long, default_value = "{}")]
    properties_json: String,
}

#[derive(Debug, Args)]
pub struct ResultsArgs {
    #[arg(long)]
    experiment: String,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct SignificanceArgs {
    #[arg(long)]
    experiment: String,
    #[arg(long)]
    variant: String,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct UserArgs {
    #[arg(long)]
    user: String,
}

#[derive(Debug, Subcommand)]
pub enum CacheCommand {
    Clear(CacheClearArgs),
}

#[derive(Debug, Args)]
pub struct CacheClearArgs {
    /// Clear a single experiment; omit to flush everything.
    #[arg(long)]
    experiment: Option<String>,
}

#[derive(Debug, Args)]
pub struct DoctorArgs {
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum StatusArg {
    Draft,
    Running,
    Paused,
    Completed,
}

/// Executes the parsed top-level CLI command graph.
///
/// # Errors
/// Returns an error when configuration loading, store open/migrate, or
/// command execution fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    init_tracing(cli.verbose);

    let config = load_engine_config(cli.config.as_deref())?;
    let store_config = StoreConfig {
        busy_timeout_ms: cli.busy_timeout_ms,
    };
    debug!(db = %cli.db.display(), busy_timeout_ms = cli.busy_timeout_ms, "opening experiment store");
    let engine = open_engine(&cli.db, store_config, config)?;
    run_command(cli.command, &engine)
}

/// Executes a parsed command against the `SQLite` DB at `db_path` with
/// default configuration.
///
/// # Errors
/// Returns an error when store open/migrate fails or the command fails.
pub fn run_with_db(db_path: &Path, command: Command) -> Result<()> {
    let engine = open_engine(db_path, StoreConfig::default(), EngineConfig::default())?;
    run_command(command, &engine)
}

/// Executes a parsed command against an existing engine.
///
/// # Errors
/// Returns an error when argument validation or the requested operation fails.
pub fn run_command(command: Command, engine: &Engine) -> Result<()> {
    match command {
        Command::Experiment { command } => run_experiment(*command, engine),
        Command::Assign(args) => {
            let mut context = RequestContext::new();
            context.extend_overrides(args.overrides.iter().map(String::as_str));
            engine.resolve(&mut context, &args.experiment, &args.user);
            print_json(&build_assignment_payload(&args.user, &context)?)
        }
        Command::IsVariant(args) => {
            let matches = engine.is_variant(&args.experiment, &args.variant, &args.user);
            print_json(&IsVariantPayload {
                contract_version: "is_variant.v1".to_string(),
                experiment: args.experiment,
                variant: args.variant,
                user_id: args.user,
                matches,
            })
        }
        Command::Track(args) => {
            let properties = parse_properties_json(&args.properties_json)?;
            let outcome = engine.track(&args.experiment, &args.user, &args.event, &properties);
            print_json(&TrackPayload {
                contract_version: "track.v1".to_string(),
                experiment: args.experiment,
                user_id: args.user,
                event_name: args.event,
                outcome,
            })
        }
        Command::Results(args) => {
            let results = engine.results(&args.experiment)?;
            if args.json {
                print_json(&results)
            } else {
                print_results_table(&results);
                Ok(())
            }
        }
        Command::Significance(args) => {
            let report = engine.significance(&args.experiment, &args.variant)?;
            if args.json {
                print_json(&report)
            } else {
                print_significance(&report);
                Ok(())
            }
        }
        Command::Events(args) => {
            let events = engine.event_summary(&args.name)?;
            print_json(&EventSummaryPayload {
                contract_version: "event_summary.v1".to_string(),
                experiment: args.name,
                events,
            })
        }
        Command::User(args) => {
            let assignments = engine.user_assignments(&args.user)?;
            print_json(&UserAssignmentsPayload {
                contract_version: "user_assignments.v1".to_string(),
                user_id: args.user,
                assignments,
            })
        }
        Command::Cache { command } => match *command {
            CacheCommand::Clear(args) => {
                engine.clear_cache(args.experiment.as_deref());
                print_json(&serde_json::json!({
                    "cleared": args.experiment.unwrap_or_else(|| "*".to_string()),
                }))
            }
        },
        Command::Doctor(args) => {
            let report = engine.store().integrity_check()?;
            if args.json {
                print_json(&report)?;
            } else {
                print_integrity_report(&report);
            }
            if report.healthy {
                Ok(())
            } else {
                Err(anyhow!("integrity check failed"))
            }
        }
    }
}

fn run_experiment(command: ExperimentCommand, engine: &Engine) -> Result<()> {
    match command {
        ExperimentCommand::Create(args) => {
            let experiment = engine.create_experiment(build_draft(args)?)?;
            print_json(&experiment)
        }
        ExperimentCommand::Update(args) => {
            let name = args.name.clone();
            let experiment = engine.update_experiment(&name, build_patch(args)?)?;
            print_json(&experiment)
        }
        ExperimentCommand::Delete(args) => {
            engine.delete_experiment(&args.name)?;
            print_json(&serde_json::json!({ "deleted": args.name }))
        }
        ExperimentCommand::Toggle(args) => print_json(&engine.toggle_active(&args.name)?),
        ExperimentCommand::Status(args) => {
            print_json(&engine.set_status(&args.name, map_status(args.set))?)
        }
        ExperimentCommand::List(args) => {
            let experiments = engine.list_experiments()?;
            if args.json {
                print_json(&ExperimentListPayload {
                    contract_version: "experiment_list.v1".to_string(),
                    experiments,
                })
            } else {
                print_experiment_table(&experiments);
                Ok(())
            }
        }
        ExperimentCommand::Show(args) => print_json(&engine.experiment(&args.name)?),
        ExperimentCommand::Reset(args) => {
            let report = engine.reset_experiment(&args.name)?;
            print_json(&ResetPayload {
                contract_version: "experiment_reset.v1".to_string(),
                experiment: args.name,
                report,
            })
        }
    }
}

/// Installs the stderr subscriber. `--verbose` wins over `RUST_LOG`, which
/// wins over the `warn` default. Repeated calls are ignored.
pub fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn open_engine(db_path: &Path, store_config: StoreConfig, config: EngineConfig) -> Result<Engine> {
    let store = SqliteExperimentStore::open(db_path, store_config)?;
    store.migrate()?;
    Ok(ExperimentEngine::new(store, config))
}

fn load_engine_config(path: Option<&Path>) -> Result<EngineConfig> {
    let Some(path) = path else {
        return Ok(EngineConfig::default());
    };

    let body = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let value: Value = serde_json::from_str(&body)
        .with_context(|| format!("config file {} is not valid JSON", path.display()))?;
    EngineConfig::from_json(&value).map_err(|err| anyhow!(err.to_string()))
}

fn build_draft(args: CreateArgs) -> Result<ExperimentDraft> {
    Ok(ExperimentDraft {
        name: args.name,
        description: args.description,
        variants: parse_variants(&args.variants)?,
        is_active: args.active,
        status: map_status(args.status),
        start_date: parse_optional_utc(args.start_date.as_deref(), "--start-date")?,
        end_date: parse_optional_utc(args.end_date.as_deref(), "--end-date")?,
        traffic_allocation: args.traffic_allocation,
        minimum_sample_size: args.minimum_sample_size,
        confidence_level: args.confidence_level,
        target_applications: args.target_applications,
    })
}

fn build_patch(args: UpdateArgs) -> Result<ExperimentPatch> {
    let start_date = if args.clear_start_date {
        Some(None)
    } else {
        parse_optional_utc(args.start_date.as_deref(), "--start-date")?.map(Some)
    };
    let end_date = if args.clear_end_date {
        Some(None)
    } else {
        parse_optional_utc(args.end_date.as_deref(), "--end-date")?.map(Some)
    };

    Ok(ExperimentPatch {
        description: args.description,
        variants: if args.variants.is_empty() {
            None
        } else {
            Some(parse_variants(&args.variants)?)
        },
        is_active: args.active,
        status: args.status.map(map_status),
        start_date,
        end_date,
        traffic_allocation: args.traffic_allocation,
        minimum_sample_size: args.minimum_sample_size,
        confidence_level: args.confidence_level,
        target_applications: if args.target_applications.is_empty() {
            None
        } else {
            Some(args.target_applications)
        },
    })
}

fn parse_variants(raw: &[String]) -> Result<Vec<Variant>> {
    raw.iter()
        .map(|item| parse_variant_pair(item).map_err(|err| anyhow!(err.to_string())))
        .collect()
}

fn parse_properties_json(raw: &str) -> Result<Properties> {
    match serde_json::from_str::<Value>(raw).context("--properties-json must be valid JSON")? {
        Value::Object(map) => Ok(map),
        other => Err(anyhow!(
            "--properties-json must be a JSON object, got {other}"
        )),
    }
}

fn parse_optional_utc(raw: Option<&str>, flag: &str) -> Result<Option<OffsetDateTime>> {
    raw.map(|value| parse_rfc3339_utc(value).map_err(|err| anyhow!("invalid {flag} value: {err}")))
        .transpose()
}

fn map_status(value: StatusArg) -> ExperimentStatus {
    match value {
        StatusArg::Draft => ExperimentStatus::Draft,
        StatusArg::Running => ExperimentStatus::Running,
        StatusArg::Paused => ExperimentStatus::Paused,
        StatusArg::Completed => ExperimentStatus::Completed,
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_experiment_table(experiments: &[Experiment]) {
    println!(
        "{:<28} {:<10} {:<7} {:<8} variants",
        "name", "status", "active", "traffic"
    );
    println!("{}", "-".repeat(80));
    for experiment in experiments {
        let variants = experiment
            .variants
            .iter()
            .map(|variant| format!("{}={}", variant.name, variant.weight))
            .collect::<Vec<_>>()
            .join(",");
        println!(
            "{:<28} {:<10} {:<7} {:<8} {}",
            experiment.name,
            experiment.status,
            if experiment.is_active { "yes" } else { "no" },
            experiment.traffic_allocation,
            variants
        );
    }
}

fn print_results_table(results: &ExperimentResults) {
    println!(
        "contract={} experiment={} status={} live={}",
        results.contract_version,
        results.experiment,
        results.status,
        if results.is_live { "yes" } else { "no" }
    );
    println!(
        "{:<20} {:<7} {:<12} {:<12} rate_pct",
        "variant", "weight", "assignments", "conversions"
    );
    println!("{}", "-".repeat(66));
    for item in &results.variants {
        println!(
            "{:<20} {:<7} {:<12} {:<12} {:.2}",
            item.variant, item.weight, item.assignments, item.conversions, item.conversion_rate
        );
    }
    println!(
        "{:<20} {:<7} {:<12} {:<12} {:.2}",
        "total",
        "",
        results.totals.assignments,
        results.totals.conversions,
        results.totals.conversion_rate
    );
}

fn print_significance(report: &SignificanceReport) {
    println!(
        "contract={} experiment={} variant={}",
        report.contract_version, report.experiment, report.variant
    );
    println!(
        "significant={} confidence={:.2} p_value={:.4} z_score={:.3}",
        if report.significant { "yes" } else { "no" },
        report.confidence,
        report.p_value,
        report.z_score
    );
    println!("message={}", report.message);
}

fn print_integrity_report(report: &IntegrityReport) {
    println!(
        "contract={} experiments={} assignments={} events={}",
        report.contract_version, report.experiments, report.assignments, report.events
    );
    println!("healthy={}", if report.healthy { "yes" } else { "no" });
    if !report.issues.is_empty() {
        let formatted = report
            .issues
            .iter()
            .map(|item| {
                let severity = match item.severity {
                    IntegrityIssueSeverity::Warning => "warning",
                    IntegrityIssueSeverity::Error => "error",
                };
                format!("{severity}:{}:{}", item.code, item.message)
            })
            .collect::<Vec<_>>()
            .join(" | ");
        println!("issues={formatted}");
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct AssignmentPayload {
    contract_version: String,
    experiment: String,
    user_id: String,
    variant: String,
    sticky: bool,
    decision: Decision,
    /// Every decision made while serving the request, in order.
    exposures: Vec<Decision>,
}

fn build_assignment_payload(user_id: &str, context: &RequestContext) -> Result<AssignmentPayload> {
    let decision = context
        .exposures()
        .last()
        .cloned()
        .ok_or_else(|| anyhow!("no assignment decision recorded"))?;

    Ok(AssignmentPayload {
        contract_version: "assignment.v1".to_string(),
        experiment: decision.experiment.clone(),
        user_id: user_id.to_string(),
        variant: decision.variant.clone(),
        sticky: decision.is_sticky(),
        decision,
        exposures: context.exposures().to_vec(),
    })
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct IsVariantPayload {
    contract_version: String,
    experiment: String,
    variant: String,
    user_id: String,
    matches: bool,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct TrackPayload {
    contract_version: String,
    experiment: String,
    user_id: String,
    event_name: String,
    outcome: TrackOutcome,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct EventSummaryPayload {
    contract_version: String,
    experiment: String,
    events: Vec<EventSummary>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct UserAssignmentsPayload {
    contract_version: String,
    user_id: String,
    assignments: Vec<UserAssignment>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct ExperimentListPayload {
    contract_version: String,
    experiments: Vec<Experiment>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct ResetPayload {
    contract_version: String,
    experiment: String,
    report: ResetReport,
}
