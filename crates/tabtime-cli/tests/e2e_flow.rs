//! End-to-end tests for the tabtime binary.
//!
//! Each test gets its own HOME and database, and drives the binary the way
//! a user or a browser relay would.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};

use tempfile::TempDir;

fn tabtime_binary() -> String {
    env!("CARGO_BIN_EXE_tabtime").to_string()
}

fn db_path(temp: &Path) -> PathBuf {
    temp.join("data").join("tabtime.db")
}

fn tabtime(temp: &Path) -> Command {
    let mut cmd = Command::new(tabtime_binary());
    cmd.env("HOME", temp)
        .env("XDG_CONFIG_HOME", temp.join("config"))
        .env("TABTIME_DATABASE_PATH", db_path(temp))
        .env_remove("RUST_LOG");
    cmd
}

fn run_ok(temp: &Path, args: &[&str]) -> String {
    let output = tabtime(temp).args(args).output().unwrap();
    assert_success(&output, args);
    String::from_utf8(output.stdout).unwrap()
}

fn assert_success(output: &Output, args: &[&str]) {
    assert!(
        output.status.success(),
        "tabtime {args:?} should succeed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
}

/// Pipes `input` into `tabtime run` and returns its stdout.
fn run_engine(temp: &Path, input: &str) -> String {
    let mut child = tabtime(temp)
        .arg("run")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .unwrap();
    child
        .stdin
        .take()
        .unwrap()
        .write_all(input.as_bytes())
        .unwrap();
    let output = child.wait_with_output().unwrap();
    assert_success(&output, &["run"]);
    String::from_utf8(output.stdout).unwrap()
}

#[test]
fn test_report_on_fresh_database() {
    let temp = TempDir::new().unwrap();

    let stdout = run_ok(temp.path(), &["report"]);

    assert_eq!(stdout, "No usage data recorded yet. Start browsing!\n");
    assert!(db_path(temp.path()).exists(), "database should be created");
}

#[test]
fn test_engine_answers_status_and_records_time() {
    let temp = TempDir::new().unwrap();
    let input = concat!(
        r#"{"type":"activated","tab_id":7,"url":"https://github.com/rust-lang"}"#,
        "\n",
        r#"{"command":"getTrackingStatus"}"#,
        "\n",
    );

    let stdout = run_engine(temp.path(), input);
    assert_eq!(stdout, "{\"isTracking\":true}\n");

    let report: serde_json::Value =
        serde_json::from_str(&run_ok(temp.path(), &["report", "--json"])).unwrap();
    // The session is too short to promise a nonzero total, but anything
    // recorded must be attributed to the active tab's domain.
    for entry in report["domains"].as_array().unwrap() {
        assert_eq!(entry["domain"], "github.com");
        assert!(entry["seconds"].as_f64().unwrap() >= 0.0);
    }
}

#[test]
fn test_engine_ignores_browser_pages() {
    let temp = TempDir::new().unwrap();
    let input = concat!(
        r#"{"type":"activated","tab_id":1,"url":"chrome://extensions"}"#,
        "\n",
        r#"{"command":"setTracking","enabled":false}"#,
        "\n",
    );

    let stdout = run_engine(temp.path(), input);
    assert_eq!(stdout, "{\"isTracking\":false}\n");

    let report = run_ok(temp.path(), &["report", "--json"]);
    assert!(!report.contains("chrome"), "unexpected entry: {report}");
}

#[test]
fn test_clear_after_engine_run() {
    let temp = TempDir::new().unwrap();
    run_engine(
        temp.path(),
        "{\"type\":\"activated\",\"tab_id\":1,\"url\":\"https://a.com\"}\n",
    );

    let stdout = run_ok(temp.path(), &["clear"]);
    assert_eq!(stdout, "Tracking data successfully cleared!\n");

    let stdout = run_ok(temp.path(), &["clear"]);
    assert_eq!(stdout, "No tracking data to clear.\n");
}

#[test]
fn test_timer_persists_between_invocations() {
    let temp = TempDir::new().unwrap();

    assert_eq!(run_ok(temp.path(), &["timer", "show"]), "25:00 (paused)\n");
    assert_eq!(run_ok(temp.path(), &["timer", "set", "5"]), "05:00 (paused)\n");
    assert_eq!(run_ok(temp.path(), &["timer", "show"]), "05:00 (paused)\n");
    assert_eq!(run_ok(temp.path(), &["timer", "reset"]), "25:00 (paused)\n");
}

#[test]
fn test_stopwatch_pause_keeps_elapsed() {
    let temp = TempDir::new().unwrap();

    assert_eq!(
        run_ok(temp.path(), &["stopwatch", "show"]),
        "00:00.00 (paused)\n"
    );
    let started = run_ok(temp.path(), &["stopwatch", "start"]);
    assert!(started.ends_with("(running)\n"), "got {started}");
    let paused = run_ok(temp.path(), &["stopwatch", "pause"]);
    assert!(paused.ends_with("(paused)\n"), "got {paused}");
    assert_eq!(run_ok(temp.path(), &["stopwatch", "show"]), paused);
}

#[test]
fn test_status_reports_configuration() {
    let temp = TempDir::new().unwrap();

    let stdout = run_ok(temp.path(), &["status"]);

    assert!(stdout.contains(&format!("Database: {}", db_path(temp.path()).display())));
    assert!(stdout.contains("Tracking on start: on"));
    assert!(stdout.contains("No domains tracked."));
}
