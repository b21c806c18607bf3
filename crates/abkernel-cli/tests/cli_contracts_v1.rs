#![allow(clippy::single_match_else, clippy::uninlined_format_args)]

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use jsonschema::JSONSchema;
use rusqlite::Connection;
use serde_json::Value;
use ulid::Ulid;

fn abk_binary_path() -> PathBuf {
    match std::env::var("CARGO_BIN_EXE_abk") {
        Ok(value) => PathBuf::from(value),
        Err(_) => {
            let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../target/debug/abk");
            if !path.exists() {
                let status = Command::new("cargo")
                    .args(["build", "-p", "abkernel-cli", "--bin", "abk"])
                    .status();
                match status {
                    Ok(value) if value.success() => {}
                    Ok(value) => panic!("failed to build abk binary (status={value})"),
                    Err(err) => panic!("failed to invoke cargo build: {err}"),
                }
            }
            path
        }
    }
}

fn abk_output(db_path: &Path, args: &[&str]) -> Output {
    let mut command = Command::new(abk_binary_path());
    command.arg("--db").arg(db_path);
    for arg in args {
        command.arg(arg);
    }

    match command.output() {
        Ok(output) => output,
        Err(err) => panic!("failed to run abk command {:?}: {err}", args),
    }
}

fn abk_success(db_path: &Path, args: &[&str]) -> Value {
    let output = abk_output(db_path, args);
    assert!(
        output.status.success(),
        "abk {:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
    stdout_json(&output)
}

fn stdout_json(output: &Output) -> Value {
    match serde_json::from_slice::<Value>(&output.stdout) {
        Ok(value) => value,
        Err(err) => panic!(
            "failed to parse stdout as JSON: {err}\nstdout={}\nstderr={}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        ),
    }
}

fn schema_path(name: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../../contracts/v1/schemas")
        .join(name)
}

fn assert_schema(schema_name: &str, value: &Value) {
    let path = schema_path(schema_name);
    let body = match fs::read_to_string(&path) {
        Ok(value) => value,
        Err(err) => panic!("failed to read {}: {err}", path.display()),
    };
    let schema: Value = match serde_json::from_str(&body) {
        Ok(value) => value,
        Err(err) => panic!("failed to parse {}: {err}", path.display()),
    };
    let compiled = match JSONSchema::compile(&schema) {
        Ok(value) => value,
        Err(err) => panic!("failed to compile {}: {err}", path.display()),
    };
    if let Some(errors) = compiled
        .validate(value)
        .err()
        .map(|iter| iter.map(|err| err.to_string()).collect::<Vec<_>>())
    {
        panic!(
            "schema validation failed for {}:\n{}\nvalue={value}",
            path.display(),
            errors.join("\n")
        );
    }
}

fn temp_db(label: &str) -> PathBuf {
    std::env::temp_dir().join(format!("abk-contract-{label}-{}.sqlite3", Ulid::new()))
}

fn create_running_experiment(db_path: &Path, name: &str) -> Value {
    abk_success(
        db_path,
        &[
            "experiment",
            "create",
            "--name",
            name,
            "--variant",
            "control=50",
            "--variant",
            "variant_a=50",
            "--active",
            "--status",
            "running",
        ],
    )
}

#[test]
fn help_contract_lists_expected_subcommands() {
    let output = match Command::new(abk_binary_path()).arg("--help").output() {
        Ok(value) => value,
        Err(err) => panic!("failed to run help command: {err}"),
    };

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    for required in [
        "experiment",
        "assign",
        "is-variant",
        "track",
        "results",
        "significance",
        "events",
        "user",
        "cache",
        "doctor",
    ] {
        assert!(
            stdout.contains(required),
            "expected help output to contain subcommand {required}; output={stdout}"
        );
    }
}

#[test]
fn assignment_and_tracking_payloads_match_schemas() {
    let db_path = temp_db("assign");
    let created = create_running_experiment(&db_path, "checkout_flow");
    assert_eq!(created["name"], Value::String("checkout_flow".to_string()));
    assert_eq!(created["variants"][0]["name"], Value::String("control".to_string()));

    let first = abk_success(
        &db_path,
        &["assign", "--experiment", "checkout_flow", "--user", "user-1"],
    );
    assert_schema("assignment.schema.json", &first);
    assert_eq!(first["sticky"], Value::Bool(true));
    assert_eq!(first["exposures"].as_array().map(Vec::len), Some(1));
    assert_eq!(first["exposures"][0], first["decision"]);

    let second = abk_success(
        &db_path,
        &["assign", "--experiment", "checkout_flow", "--user", "user-1"],
    );
    assert_eq!(second["variant"], first["variant"]);
    assert_eq!(second["decision"]["source"]["kind"], Value::String("existing".to_string()));

    let overridden = abk_success(
        &db_path,
        &[
            "assign",
            "--experiment",
            "checkout_flow",
            "--user",
            "user-2",
            "--override",
            "checkout_flow=variant_a",
        ],
    );
    assert_schema("assignment.schema.json", &overridden);
    assert_eq!(overridden["variant"], Value::String("variant_a".to_string()));
    assert_eq!(overridden["sticky"], Value::Bool(false));

    for expected_count in 1..=2_u64 {
        let tracked = abk_success(
            &db_path,
            &[
                "track",
                "--experiment",
                "checkout_flow",
                "--user",
                "user-1",
                "--event",
                "click",
                "--properties-json",
                r#"{"button":"buy"}"#,
            ],
        );
        assert_schema("track.schema.json", &tracked);
        assert_eq!(tracked["outcome"]["status"], Value::String("recorded".to_string()));
        assert_eq!(tracked["outcome"]["count"], Value::Number(expected_count.into()));
        assert_eq!(tracked["outcome"]["variant"], first["variant"]);
    }

    let dropped = abk_success(
        &db_path,
        &["track", "--experiment", "missing", "--user", "user-1"],
    );
    assert_schema("track.schema.json", &dropped);
    assert_eq!(
        dropped["outcome"]["reason"],
        Value::String("experiment_not_found".to_string())
    );

    let events = abk_success(&db_path, &["events", "--name", "checkout_flow"]);
    assert_eq!(events["contract_version"], Value::String("event_summary.v1".to_string()));
    assert_eq!(events["events"][0]["occurrences"], Value::Number(2_u64.into()));

    let _ = fs::remove_file(&db_path);
}

#[test]
fn results_and_significance_payloads_match_schemas() {
    let db_path = temp_db("results");
    create_running_experiment(&db_path, "checkout_flow");

    for index in 0..6 {
        let user = format!("user-{index}");
        abk_success(
            &db_path,
            &["assign", "--experiment", "checkout_flow", "--user", &user],
        );
        if index % 2 == 0 {
            abk_success(
                &db_path,
                &["track", "--experiment", "checkout_flow", "--user", &user],
            );
        }
    }

    let results = abk_success(
        &db_path,
        &["results", "--experiment", "checkout_flow", "--json"],
    );
    assert_schema("experiment-results.schema.json", &results);
    assert_eq!(results["totals"]["assignments"], Value::Number(6_u64.into()));
    assert_eq!(results["totals"]["conversions"], Value::Number(3_u64.into()));
    assert_eq!(results["totals"]["conversion_rate"], serde_json::json!(50.0));

    let significance = abk_success(
        &db_path,
        &[
            "significance",
            "--experiment",
            "checkout_flow",
            "--variant",
            "variant_a",
            "--json",
        ],
    );
    assert_schema("significance.schema.json", &significance);
    assert_eq!(
        significance["message"],
        Value::String("Insufficient sample size".to_string())
    );
    assert_eq!(significance["significant"], Value::Bool(false));

    let _ = fs::remove_file(&db_path);
}

#[test]
fn error_shape_for_missing_experiment_is_stable() {
    let db_path = temp_db("missing");
    let output = abk_output(&db_path, &["results", "--experiment", "missing", "--json"]);
    assert!(!output.status.success());

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("experiment not found: missing"),
        "expected stable error shape, got stderr={stderr}"
    );

    let _ = fs::remove_file(&db_path);
}

#[test]
fn unknown_experiment_assignment_falls_back_to_control() {
    let db_path = temp_db("fallback");
    let payload = abk_success(
        &db_path,
        &["assign", "--experiment", "missing", "--user", "user-1"],
    );
    assert_schema("assignment.schema.json", &payload);
    assert_eq!(payload["variant"], Value::String("control".to_string()));
    assert_eq!(
        payload["decision"]["source"],
        serde_json::json!({"kind": "fallback", "detail": "experiment_not_found"})
    );

    let is_variant = abk_success(
        &db_path,
        &[
            "is-variant",
            "--experiment",
            "missing",
            "--variant",
            "control",
            "--user",
            "user-1",
        ],
    );
    assert_eq!(is_variant["matches"], Value::Bool(true));

    let _ = fs::remove_file(&db_path);
}

#[test]
fn doctor_flags_rows_that_disagree_with_assignments() {
    let db_path = temp_db("doctor");
    create_running_experiment(&db_path, "checkout_flow");
    abk_success(
        &db_path,
        &["assign", "--experiment", "checkout_flow", "--user", "user-1"],
    );
    abk_success(
        &db_path,
        &["track", "--experiment", "checkout_flow", "--user", "user-1"],
    );

    let healthy = abk_success(&db_path, &["doctor", "--json"]);
    assert_eq!(
        healthy["contract_version"],
        Value::String("integrity_check.v1".to_string())
    );
    assert_eq!(healthy["healthy"], Value::Bool(true));

    let conn = match Connection::open(&db_path) {
        Ok(value) => value,
        Err(err) => panic!("failed to open db for tampering: {err}"),
    };
    if let Err(err) = conn.execute(
        "UPDATE ab_events SET variant = 'tampered' WHERE user_id = 'user-1'",
        [],
    ) {
        panic!("failed to tamper event row: {err}");
    }

    let output = abk_output(&db_path, &["doctor", "--json"]);
    assert!(!output.status.success());
    let payload = stdout_json(&output);
    assert_eq!(payload["healthy"], Value::Bool(false));
    assert_eq!(
        payload["issues"][0]["code"],
        Value::String("event_variant_mismatch".to_string())
    );

    let _ = fs::remove_file(&db_path);
}

#[test]
fn tracking_after_pause_keeps_assigned_variant_and_consistent_results() {
    let db_path = temp_db("paused-track");
    create_running_experiment(&db_path, "checkout_flow");
    let assigned = abk_success(
        &db_path,
        &["assign", "--experiment", "checkout_flow", "--user", "user-1"],
    );

    abk_success(
        &db_path,
        &["experiment", "status", "--name", "checkout_flow", "--set", "paused"],
    );
    let tracked = abk_success(
        &db_path,
        &["track", "--experiment", "checkout_flow", "--user", "user-1"],
    );
    assert_schema("track.schema.json", &tracked);
    assert_eq!(tracked["outcome"]["variant"], assigned["variant"]);

    let results = abk_success(
        &db_path,
        &["results", "--experiment", "checkout_flow", "--json"],
    );
    assert_schema("experiment-results.schema.json", &results);
    assert_eq!(results["totals"]["assignments"], Value::Number(1_u64.into()));
    assert_eq!(results["totals"]["conversions"], Value::Number(1_u64.into()));

    let doctor = abk_success(&db_path, &["doctor", "--json"]);
    assert_eq!(doctor["healthy"], Value::Bool(true));

    let _ = fs::remove_file(&db_path);
}

#[test]
fn lifecycle_commands_round_trip_through_the_registry() {
    let db_path = temp_db("lifecycle");
    create_running_experiment(&db_path, "checkout_flow");

    let paused = abk_success(
        &db_path,
        &["experiment", "status", "--name", "checkout_flow", "--set", "paused"],
    );
    assert_eq!(paused["status"], Value::String("paused".to_string()));

    let fallback = abk_success(
        &db_path,
        &["assign", "--experiment", "checkout_flow", "--user", "user-1"],
    );
    assert_eq!(
        fallback["decision"]["source"]["detail"],
        Value::String("not_live".to_string())
    );

    let toggled = abk_success(&db_path, &["experiment", "toggle", "--name", "checkout_flow"]);
    assert_eq!(toggled["is_active"], Value::Bool(false));

    let listed = abk_success(&db_path, &["experiment", "list", "--json"]);
    assert_eq!(
        listed["contract_version"],
        Value::String("experiment_list.v1".to_string())
    );
    assert_eq!(listed["experiments"].as_array().map(Vec::len), Some(1));

    abk_success(&db_path, &["experiment", "delete", "--name", "checkout_flow"]);
    let output = abk_output(&db_path, &["experiment", "show", "--name", "checkout_flow"]);
    assert!(!output.status.success());

    let _ = fs::remove_file(&db_path);
}
