//! Black-box tests of the `harvest` binary with shell-script engines.
#![cfg(unix)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

const DECODER: &str = r#"#!/bin/sh
# <source> -o <output> -blnk -<system> [-xw]
echo '<xml/>' > "$3"
"#;

const FAILING_DECODER: &str = r#"#!/bin/sh
echo "cannot parse recording" >&2
exit 3
"#;

const ENCODER: &str = r#"#!/bin/sh
# ... --offset <n> [-n] <input>
for last; do :; done
base="${last%.xml}"
echo h5 > "${base}-_-2024-01-01.hdf5"
"#;

fn harvest_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("harvest");
    path
}

fn write_script(path: &Path, body: &str) {
    fs::write(path, body).unwrap();
    let mut perms = fs::metadata(path).unwrap().permissions();
    perms.set_mode(0o755);
    fs::set_permissions(path, perms).unwrap();
}

fn setup_test_env(decoder: &str) -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    let bin_dir = root.join("bin");
    for dir in [&config_dir, &bin_dir] {
        fs::create_dir_all(dir).unwrap();
    }
    for dir in ["incoming", "out", "updates"] {
        fs::create_dir_all(root.join(dir)).unwrap();
    }
    write_script(&bin_dir.join("decoder"), decoder);
    write_script(&bin_dir.join("encoder"), ENCODER);

    let config_content = format!(
        r#"[paths]
input_root = "{0}/incoming"
output_root = "{0}/out"
identity_db = "{0}/patients.sqlite"
identity_updates = "{0}/updates"

[engine]
decoder = "{0}/bin/decoder"
encoder = "{0}/bin/encoder"
system = "cs"

[pipeline]
workers = 2
job_timeout_secs = 30
poll_interval_secs = 1

[logging]
level = "debug"
"#,
        root.display()
    );

    let config_path = config_dir.join("harvest.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_harvest(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = harvest_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .env_remove("RUST_LOG")
        .output()
        .unwrap_or_else(|e| panic!("Failed to run harvest binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let success = output.status.success();
    (stdout, stderr, success)
}

fn root_of(config_path: &Path) -> PathBuf {
    config_path.parent().unwrap().parent().unwrap().to_path_buf()
}

fn seed_identity(config_path: &Path, rows: &str) {
    let root = root_of(config_path);
    fs::write(
        root.join("updates/batch.csv"),
        format!("STPFile,PatientID,Offset\n{}", rows),
    )
    .unwrap();
    let (stdout, stderr, success) = run_harvest(config_path, &["refresh"]);
    assert!(success, "refresh failed: stdout={}, stderr={}", stdout, stderr);
}

#[test]
fn test_init_creates_tree() {
    let (tmp, config_path) = setup_test_env(DECODER);

    let (stdout, stderr, success) = run_harvest(&config_path, &["init", "--create-identity-store"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("Output tree ready"));

    let out = tmp.path().join("out");
    for dir in [
        "Converted",
        "Success",
        "Processing",
        "Skipped/AlreadyDone",
        "Skipped/NotInPatientDatabase",
        "Failed/TimedOut",
        "Failed/ErroredOut",
    ] {
        assert!(out.join(dir).is_dir(), "missing {}", dir);
    }
    assert!(out.join("CompletedFiles.sqlite").is_file());
    assert!(tmp.path().join("patients.sqlite").is_file());
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config_path) = setup_test_env(DECODER);

    let (_, _, success1) = run_harvest(&config_path, &["init", "--create-identity-store"]);
    assert!(success1, "First init failed");

    let (_, _, success2) = run_harvest(&config_path, &["init", "--create-identity-store"]);
    assert!(success2, "Second init failed (not idempotent)");
}

#[test]
fn test_once_without_identity_store_is_fatal() {
    let (_tmp, config_path) = setup_test_env(DECODER);

    let (_, stderr, success) = run_harvest(&config_path, &["once"]);
    assert!(!success);
    assert!(stderr.contains("identity_db"), "stderr={}", stderr);
}

#[test]
fn test_invalid_config_rejected() {
    let (_tmp, config_path) = setup_test_env(DECODER);
    let text = fs::read_to_string(&config_path).unwrap();
    fs::write(&config_path, text.replace("workers = 2", "workers = 0")).unwrap();

    let (_, stderr, success) = run_harvest(&config_path, &["status"]);
    assert!(!success);
    assert!(stderr.contains("workers"));
}

#[test]
fn test_once_delivers_and_status_reports() {
    let (tmp, config_path) = setup_test_env(DECODER);
    run_harvest(&config_path, &["init", "--create-identity-store"]);
    seed_identity(&config_path, "BED1-1000.stp,42,100\n");

    fs::write(tmp.path().join("incoming/BED1-1000.stp"), vec![1u8; 1000]).unwrap();
    let (stdout, stderr, success) = run_harvest(&config_path, &["once"]);
    assert!(success, "once failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("Delivered 1 file"), "stdout={}", stdout);
    assert!(stderr.contains("1/1 done (Successful: 1, Timeout: 0, Error: 0)"));

    assert!(tmp
        .path()
        .join("out/Success/42/UVA_42_19724_BED1-900_V.hdf5")
        .is_file());

    let (stdout, _, success) = run_harvest(&config_path, &["status", "--json"]);
    assert!(success);
    let report: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(report["ledger_entries"], 1);
    assert_eq!(report["identity_records"], 1);
    assert_eq!(report["delivered"], 1);
    assert_eq!(report["patients"], 1);
}

#[test]
fn test_once_routes_engine_failure() {
    let (tmp, config_path) = setup_test_env(FAILING_DECODER);
    run_harvest(&config_path, &["init", "--create-identity-store"]);
    seed_identity(&config_path, "BED2-2000.stp,7,0\n");

    fs::write(tmp.path().join("incoming/BED2-2000.stp"), vec![1u8; 1000]).unwrap();
    let (stdout, stderr, success) = run_harvest(&config_path, &["once"]);
    assert!(success, "once failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("Nothing delivered"), "stdout={}", stdout);
    assert!(stderr.contains("cannot parse recording"));

    assert!(tmp
        .path()
        .join("out/Failed/ErroredOut/BED2-2000.stp")
        .is_file());
    assert!(!tmp.path().join("incoming/BED2-2000.stp").exists());

    let (stdout, _, _) = run_harvest(&config_path, &["status"]);
    assert!(stdout.contains("Completed:    0"));
}

#[test]
fn test_refresh_without_updates() {
    let (_tmp, config_path) = setup_test_env(DECODER);
    run_harvest(&config_path, &["init", "--create-identity-store"]);

    let (stdout, _, success) = run_harvest(&config_path, &["refresh"]);
    assert!(success);
    assert!(stdout.contains("No identity updates waiting"));
}
