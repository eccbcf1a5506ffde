//! Behavioural smoke tests for the CLI entrypoint.

use assert_cmd::cargo::cargo_bin_cmd;
use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

const TOKEN_VARS: [&str; 3] = [
    "DIGITALOCEAN_TOKEN",
    "DIGITALOCEAN_ACCESS_TOKEN",
    "DIGITALOCEAN_API_TOKEN",
];

/// Runs `dropsmith` in an empty directory with no inherited configuration.
fn isolated(home: &TempDir) -> Command {
    let mut cmd = cargo_bin_cmd!("dropsmith");
    cmd.current_dir(home.path())
        .env("HOME", home.path())
        .env("XDG_CONFIG_HOME", home.path())
        .env_remove("DROPSMITH_CONFIG_PATH")
        .env_remove("DIGITALOCEAN_REGION")
        .env_remove("DIGITALOCEAN_SIZE")
        .env_remove("DIGITALOCEAN_IMAGE");
    for var in TOKEN_VARS {
        cmd.env_remove(var);
    }
    cmd
}

#[test]
fn help_lists_the_build_subcommand() {
    let mut cmd = cargo_bin_cmd!("dropsmith");
    cmd.arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("build"));
}

#[test]
fn build_without_token_fails_with_actionable_error() {
    let home = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
    isolated(&home)
        .arg("build")
        .assert()
        .code(1)
        .stdout("")
        .stderr(predicate::str::contains("DIGITALOCEAN_TOKEN"));
}

#[test]
fn build_without_region_names_the_region_variable() {
    let home = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
    isolated(&home)
        .env("DIGITALOCEAN_ACCESS_TOKEN", "dop_v1_fallback")
        .arg("build")
        .assert()
        .code(1)
        .stderr(predicate::str::contains("DIGITALOCEAN_REGION"))
        .stderr(predicate::str::contains("dop_v1_fallback").not());
}
