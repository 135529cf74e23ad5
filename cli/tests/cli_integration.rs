//! Integration test: run the `chartwrap` binary.
//!
//! Only commands that need no registry are exercised here; registry-backed
//! flows are covered by the engine tests against an in-memory registry.

use std::path::Path;
use std::process::Command;

/// Run chartwrap and return (stdout, stderr, success).
fn run(args: &[&str]) -> (String, String, bool) {
    let output = Command::new(env!("CARGO_BIN_EXE_chartwrap"))
        .args(args)
        .env_remove("RUST_LOG")
        .env_remove("REGISTRY_USERNAME")
        .env_remove("REGISTRY_PASSWORD")
        .output()
        .expect("failed to run chartwrap");
    (
        String::from_utf8_lossy(&output.stdout).to_string(),
        String::from_utf8_lossy(&output.stderr).to_string(),
        output.status.success(),
    )
}

fn write_chart(root: &Path) {
    std::fs::create_dir_all(root).unwrap();
    std::fs::write(
        root.join("Chart.yaml"),
        "apiVersion: v2\nname: demo\nversion: 0.3.0\n",
    )
    .unwrap();
}

#[test]
fn test_version() {
    let (stdout, _, ok) = run(&["version"]);
    assert!(ok);
    assert_eq!(stdout.trim(), format!("chartwrap version {}", env!("CARGO_PKG_VERSION")));
}

#[test]
fn test_missing_chart_fails() {
    let dir = tempfile::TempDir::new().unwrap();
    let missing = dir.path().join("nope");
    let (_, stderr, ok) = run(&["lock", missing.to_str().unwrap()]);
    assert!(!ok);
    assert!(stderr.contains("Error:"), "stderr: {stderr}");
}

#[test]
fn test_bad_config_file_fails_before_dispatch() {
    let dir = tempfile::TempDir::new().unwrap();
    let config = dir.path().join("chartwrap.yaml");
    std::fs::write(&config, "transfer: [not, a, map]\n").unwrap();
    let (_, stderr, ok) = run(&["--config", config.to_str().unwrap(), "version"]);
    assert!(!ok);
    assert!(stderr.contains("Error:"), "stderr: {stderr}");
}

#[test]
fn test_chart_without_images_locks_empty() {
    let dir = tempfile::TempDir::new().unwrap();
    let chart = dir.path().join("demo");
    write_chart(&chart);

    let (stdout, stderr, ok) = run(&["lock", chart.to_str().unwrap()]);
    assert!(ok, "stderr: {stderr}");
    assert!(stdout.contains("0 image(s)"));
    let lock = std::fs::read_to_string(chart.join("Images.lock")).unwrap();
    assert!(lock.contains("name: demo"));
}

#[test]
fn test_unwrap_rejects_plain_file() {
    let dir = tempfile::TempDir::new().unwrap();
    let input = dir.path().join("chart.tgz");
    std::fs::write(&input, "plain text").unwrap();
    let (_, stderr, ok) = run(&["unwrap", input.to_str().unwrap()]);
    assert!(!ok);
    assert!(stderr.contains("Error:"));
}
