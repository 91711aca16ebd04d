use serde_json::Value;
use std::fs;
use std::path::Path;
use std::process::{Command, Output};
use tempfile::TempDir;

const REFUSAL: &str =
    "Night mode is available on the Tier 2 and Tier 3 plans. Upgrade to unlock it.";

fn home_path(home: &TempDir) -> &Path {
    home.path()
}

fn bin_path() -> &'static str {
    env!("CARGO_BIN_EXE_companion-relay")
}

fn run_cmd_with_env(home: &TempDir, args: &[&str], env: &[(&str, &str)]) -> Output {
    let mut cmd = Command::new(bin_path());
    cmd.args(args)
        .env("COMPANION_RELAY_HOME", home_path(home))
        .env("RUST_LOG", "off");
    for (key, value) in env {
        cmd.env(key, value);
    }
    cmd.output().expect("run companion-relay command")
}

fn run_cmd(home: &TempDir, args: &[&str]) -> Output {
    run_cmd_with_env(home, args, &[])
}

fn stdout_json(output: &Output) -> Value {
    serde_json::from_slice(&output.stdout).expect("valid json output")
}

#[test]
fn init_creates_config_and_data_paths() {
    let home = TempDir::new().expect("temp home");
    let output = run_cmd(&home, &["init"]);
    assert!(output.status.success());

    assert!(home.path().join("config").exists());
    assert!(home.path().join("data").exists());
    assert!(home.path().join("config").join("config.toml").exists());
}

#[test]
fn init_is_idempotent() {
    let home = TempDir::new().expect("temp home");

    assert!(run_cmd(&home, &["init"]).status.success());
    let first = fs::read_to_string(home.path().join("config").join("config.toml"))
        .expect("read config after first init");

    assert!(run_cmd(&home, &["init"]).status.success());
    let second = fs::read_to_string(home.path().join("config").join("config.toml"))
        .expect("read config after second init");

    assert_eq!(first, second);
}

#[test]
fn quota_reports_free_and_paid_snapshots() {
    let home = TempDir::new().expect("temp home");
    assert!(run_cmd(&home, &["init"]).status.success());

    let free = run_cmd(&home, &["quota", "--uid", "u1"]);
    assert!(free.status.success());
    let snapshot = stdout_json(&free);
    assert_eq!(snapshot["remaining_total"], 50);
    assert_eq!(snapshot["remaining_today"], 15);
    assert_eq!(snapshot["unlimited"], false);

    let paid = run_cmd(&home, &["quota", "--uid", "u1", "--tier", "tier2"]);
    let snapshot = stdout_json(&paid);
    assert_eq!(snapshot["unlimited"], true);
    assert_eq!(snapshot["remaining_total"], -1);
}

#[test]
fn restricted_mode_refusal_is_audited_but_not_charged() {
    let home = TempDir::new().expect("temp home");
    assert!(run_cmd(&home, &["init"]).status.success());

    let output = run_cmd(
        &home,
        &["chat", "--uid", "u1", "--message", "hey", "--mode", "night"],
    );
    assert!(output.status.success());
    let reply = stdout_json(&output);
    assert_eq!(reply["response"], REFUSAL);
    assert_eq!(reply["provider"], "policy");

    let quota = stdout_json(&run_cmd(&home, &["quota", "--uid", "u1"]));
    assert_eq!(quota["remaining_total"], 50);

    let export = run_cmd(&home, &["export-audit", "--format", "json"]);
    assert!(export.status.success());
    let rows = stdout_json(&export);
    let rows = rows.as_array().expect("json array");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["uid"], "u1");
    assert_eq!(rows[0]["mode"], "night");
}

#[test]
fn env_override_charges_restricted_refusal() {
    let home = TempDir::new().expect("temp home");
    assert!(run_cmd(&home, &["init"]).status.success());

    let env = [("COMPANION_RELAY__ORCHESTRATOR__CHARGE_RESTRICTED_REFUSAL", "true")];
    let output = run_cmd_with_env(
        &home,
        &["chat", "--uid", "u1", "--message", "hey", "--mode", "night"],
        &env,
    );
    assert!(output.status.success());

    let quota = stdout_json(&run_cmd(&home, &["quota", "--uid", "u1"]));
    assert_eq!(quota["remaining_total"], 49);
    assert_eq!(quota["remaining_today"], 14);
}

#[test]
fn chat_without_providers_reports_exhausted_chain() {
    let home = TempDir::new().expect("temp home");
    assert!(run_cmd(&home, &["init"]).status.success());

    let output = run_cmd(&home, &["chat", "--uid", "u1", "--message", "hello"]);
    assert!(!output.status.success());
    let reply = stdout_json(&output);
    assert_eq!(reply["error"]["kind"], "provider_chain_exhausted");
    assert_eq!(reply["error"]["attempted"], serde_json::json!([]));
    assert!(reply.get("response").is_none());

    let quota = stdout_json(&run_cmd(&home, &["quota", "--uid", "u1"]));
    assert_eq!(quota["remaining_total"], 50);
}

#[test]
fn chat_rejects_blank_message() {
    let home = TempDir::new().expect("temp home");
    assert!(run_cmd(&home, &["init"]).status.success());

    let output = run_cmd(&home, &["chat", "--uid", "u1", "--message", "  "]);
    assert!(!output.status.success());
    assert_eq!(stdout_json(&output)["error"]["kind"], "invalid_input");
}

#[test]
fn export_csv_outputs_header_and_escaped_fields() {
    let home = TempDir::new().expect("temp home");
    assert!(run_cmd(&home, &["init"]).status.success());
    assert!(run_cmd(
        &home,
        &["chat", "--uid", "a,b", "--message", "say \"hi\"", "--mode", "night"],
    )
    .status
    .success());

    let output = run_cmd(&home, &["export-audit", "--format", "csv"]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("uid,mode,provider,message,reply,created_at"));
    assert!(stdout.contains("\"a,b\",night,policy,\"say \"\"hi\"\"\""));
}

#[test]
fn export_rejects_unknown_format() {
    let home = TempDir::new().expect("temp home");
    assert!(run_cmd(&home, &["init"]).status.success());

    let output = run_cmd(&home, &["export-audit", "--format", "xml"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Unsupported export format"));
}

#[test]
fn chat_stream_prints_reply_text_and_summary_on_stderr() {
    let home = TempDir::new().expect("temp home");
    assert!(run_cmd(&home, &["init"]).status.success());

    let output = run_cmd(
        &home,
        &["chat", "--uid", "u1", "--message", "hey", "--mode", "night", "--stream"],
    );
    assert!(output.status.success());
    assert_eq!(String::from_utf8_lossy(&output.stdout), format!("{REFUSAL}\n"));
    let summary: Value = serde_json::from_slice(&output.stderr).expect("json summary on stderr");
    assert_eq!(summary["provider"], "policy");
    assert_eq!(summary["remaining_total"], 50);

    let export = stdout_json(&run_cmd(&home, &["export-audit", "--format", "json"]));
    assert_eq!(export.as_array().expect("json array").len(), 1);
}

#[test]
fn chat_stream_failure_still_reports_json_error() {
    let home = TempDir::new().expect("temp home");
    assert!(run_cmd(&home, &["init"]).status.success());

    let output = run_cmd(&home, &["chat", "--uid", "u1", "--message", "hi", "--stream"]);
    assert!(!output.status.success());
    assert_eq!(stdout_json(&output)["error"]["kind"], "provider_chain_exhausted");
}

#[test]
fn chat_accepts_history_file_and_rejects_malformed_one() {
    let home = TempDir::new().expect("temp home");
    assert!(run_cmd(&home, &["init"]).status.success());

    let good = home.path().join("history.json");
    fs::write(
        &good,
        r#"[{"role": "user", "content": "hi"}, {"role": "assistant", "content": "hello"}]"#,
    )
    .expect("write history");
    let output = run_cmd(
        &home,
        &[
            "chat",
            "--uid",
            "u1",
            "--message",
            "hey",
            "--mode",
            "night",
            "--history",
            good.to_str().expect("utf-8 path"),
        ],
    );
    assert!(output.status.success());
    assert_eq!(stdout_json(&output)["response"], REFUSAL);

    let bad = home.path().join("broken.json");
    fs::write(&bad, "not json").expect("write broken history");
    let output = run_cmd(
        &home,
        &["chat", "--uid", "u1", "--message", "hey", "--history", bad.to_str().expect("utf-8 path")],
    );
    assert!(!output.status.success());
}
