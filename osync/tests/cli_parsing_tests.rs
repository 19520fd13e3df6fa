use assert_cmd::Command;
use predicates::prelude::*;

#[test]
fn help_mentions_store_uris() {
    Command::cargo_bin("osync")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("scheme://location"));
}

#[test]
fn missing_arguments_fail() {
    Command::cargo_bin("osync")
        .unwrap()
        .assert()
        .failure();
}

#[test]
fn rejects_non_uri_paths() {
    Command::cargo_bin("osync")
        .unwrap()
        .args(["/just/a/path", "mem://dst"])
        .assert()
        .failure();
}

#[test]
fn rejects_conflicting_delete_flags() {
    Command::cargo_bin("osync")
        .unwrap()
        .args(["mem://a", "mem://b", "--delete-src", "--delete-dst"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("mutually exclusive"));
}

#[test]
fn dry_run_on_empty_mem_stores_succeeds() {
    Command::cargo_bin("osync")
        .unwrap()
        .args(["mem://cli-empty-src", "mem://cli-empty-dst", "--dry"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Found: 0"));
}
