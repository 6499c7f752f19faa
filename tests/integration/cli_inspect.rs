use std::fs;
use std::path::Path;

use aostore::{IsolationLevel, Result, StoreConfig, TransactionEngine};
use assert_cmd::cargo::cargo_bin_cmd;
use serde_json::Value;
use tempfile::TempDir;

fn seed(dir: &Path, close: bool) -> Result<()> {
    let engine = TransactionEngine::open(StoreConfig::new(dir).handler_threads(1))?;
    let users = engine.open_default_map::<u64, String>("users")?;
    let mut tx = engine.begin(IsolationLevel::ReadCommitted)?;
    for key in 0..25u64 {
        tx.insert(&users, key, format!("user {key}"))?;
    }
    tx.commit()?;
    if close {
        engine.close()?;
    }
    Ok(())
}

fn json_output(args: &[&str], path: &Path) -> Value {
    let output = cargo_bin_cmd!("aostore")
        .args(["--format", "json"])
        .args(args)
        .arg(path)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    serde_json::from_slice(&output).expect("valid json")
}

#[test]
fn redo_reports_uncheckpointed_records() -> Result<()> {
    let dir = TempDir::new().expect("tempdir");
    seed(dir.path(), false)?;
    let json = json_output(&["redo"], &dir.path().join("redo_log"));
    let chunks = json.as_array().expect("chunk list");
    let records: u64 = chunks
        .iter()
        .map(|c| c["records"].as_u64().unwrap_or(0))
        .sum();
    assert_eq!(records, 25);
    assert_eq!(chunks[0]["maps"][0][0], "users");
    Ok(())
}

#[test]
fn chunks_reports_saved_footers() -> Result<()> {
    let dir = TempDir::new().expect("tempdir");
    seed(dir.path(), true)?;
    let json = json_output(&["chunks"], &dir.path().join("users"));
    let chunks = json.as_array().expect("chunk list");
    let last = chunks.last().expect("at least one chunk");
    assert_eq!(last["footer"]["map_size"].as_u64(), Some(25));
    assert!(last["error"].is_null());
    Ok(())
}

#[test]
fn config_check_accepts_valid_and_rejects_invalid_files() -> Result<()> {
    let dir = TempDir::new().expect("tempdir");
    let good = dir.path().join("good.toml");
    fs::write(&good, "base_dir = \"/var/lib/aostore\"\nredo_sync = \"periodic\"\n")?;
    let json = json_output(&["config"], &good);
    assert_eq!(json["redo_sync"], "periodic");
    assert_eq!(json["redo_log_dir"], "redo_log");

    let bad = dir.path().join("bad.toml");
    fs::write(&bad, "base_dir = \"/x\"\nhandler_threads = 0\n")?;
    cargo_bin_cmd!("aostore")
        .args(["config"])
        .arg(&bad)
        .assert()
        .failure();
    Ok(())
}
