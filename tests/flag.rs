// ABOUTME: Integration tests for the environment flag.
// ABOUTME: Tests acquisition, contention, metadata content, and release tolerance.

use anabasis::flag::{Flag, FlagError, FlagMetadata};
use tempfile::TempDir;

#[test]
fn flag_round_trip_allows_reacquisition() {
    let dir = TempDir::new().unwrap();

    let flag = Flag::acquire(dir.path(), "staging").unwrap();
    flag.release().unwrap();

    let again = Flag::acquire(dir.path(), "staging").unwrap();
    again.release().unwrap();
}

#[test]
fn contention_is_reported_while_held() {
    let dir = TempDir::new().unwrap();
    let held = Flag::acquire(dir.path(), "staging").unwrap();

    match Flag::acquire(dir.path(), "staging") {
        Err(FlagError::Contention { environment }) => assert_eq!(environment, "staging"),
        other => panic!("expected contention, got {other:?}"),
    }

    held.release().unwrap();
}

#[test]
fn metadata_is_operator_readable_json() {
    let dir = TempDir::new().unwrap();
    let flag = Flag::acquire(dir.path(), "staging").unwrap();

    let body = std::fs::read_to_string(Flag::flag_path(dir.path(), "staging")).unwrap();
    let metadata: FlagMetadata = serde_json::from_str(&body).unwrap();
    assert_eq!(metadata.environment, "staging");
    assert_eq!(metadata.pid, std::process::id());
    // The timestamp is serialized in RFC 3339 / ISO-8601 UTC form.
    assert!(body.contains("acquired_at"));

    flag.release().unwrap();
}

#[test]
fn state_directory_is_created_when_absent() {
    let dir = TempDir::new().unwrap();
    let nested = dir.path().join("deep/state");

    let flag = Flag::acquire(&nested, "staging").unwrap();
    assert!(Flag::flag_path(&nested, "staging").exists());
    flag.release().unwrap();
}

#[test]
fn release_removes_flag_but_not_the_lock_file() {
    let dir = TempDir::new().unwrap();
    let flag = Flag::acquire(dir.path(), "staging").unwrap();
    flag.release().unwrap();

    assert!(!Flag::flag_path(dir.path(), "staging").exists());
    // The advisory lock file stays behind; only the metadata file signals
    // a run in progress.
    assert!(dir.path().join("staging.flag.lock").exists());
}
