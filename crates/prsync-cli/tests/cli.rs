use assert_cmd::Command;
use predicates::prelude::*;
use std::io::Write;

fn prsync() -> Command {
    let mut cmd = Command::cargo_bin("prsync").unwrap();
    cmd.env_remove("PRSYNC_CONFIG")
        .env_remove("PRSYNC_TOKEN")
        .env_remove("GITHUB_TOKEN");
    cmd
}

#[test]
fn config_reflects_environment() {
    prsync()
        .arg("config")
        .env("PRSYNC_POLL_INTERVAL_SECS", "90")
        .env("PRSYNC_API_URL", "https://ghe.example.com/api/v3")
        .assert()
        .success()
        .stdout(predicate::str::contains("interval_ms: 90000"))
        .stdout(predicate::str::contains("https://ghe.example.com/api/v3"));
}

#[test]
fn config_file_is_loaded() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "polling:\n  interval_ms: 30000\n  cache_ttl_ms: 20000").unwrap();

    prsync()
        .arg("--config")
        .arg(file.path())
        .arg("config")
        .assert()
        .success()
        .stdout(predicate::str::contains("interval_ms: 30000"))
        .stdout(predicate::str::contains("cache_ttl_ms: 20000"));
}

#[test]
fn invalid_config_file_fails() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "polling:\n  interval_ms: 0").unwrap();

    prsync()
        .arg("--config")
        .arg(file.path())
        .arg("config")
        .assert()
        .code(2)
        .stderr(predicate::str::contains("interval_ms"));
}

#[test]
fn watch_rejects_bad_repository() {
    prsync()
        .args(["watch", "not-a-slug"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("invalid repository"));
}

#[test]
fn watch_without_token_fails() {
    prsync()
        .args(["watch", "--no-snapshots", "o/r"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("no token found"));
}
