use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use assert_cmd::prelude::*;
use predicates::prelude::*;
use predicates::str::contains;
use tempfile::TempDir;

use updater_core::config::{config_path_at, ledger_dir_at};
use updater_core::{DeploymentId, DeploymentRecord, Digest, EnvironmentId, Initiator, Outcome};
use updater_engine::{DeploymentLedger, FileLedger};

fn updater_cmd(home: &Path) -> Command {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("image-updater"));
    cmd.env("HOME", home)
        .env("USERPROFILE", home)
        .env_remove("RUST_LOG");
    cmd
}

const CONFIG: &str = "\
version: 1
defaults:
  poll_interval_secs: 120
repositories:
  - id: deploy
    url: file:///srv/git/deploy.git
    branch: main
environments:
  - id: staging
    application: web
    repository: deploy
    manifest_path: apps/web/values-staging.yaml
    image: nginx
  - id: production
    application: web
    repository: deploy
    manifest_path: apps/web/values-production.yaml
    image: nginx
    policy: lexical
    poll_interval_secs: 600
";

fn write_config(home: &Path) {
    let path = config_path_at(home);
    fs::create_dir_all(path.parent().expect("config dir")).expect("create config dir");
    fs::write(&path, CONFIG).expect("write config");
}

/// Append a pending record and settle it, as the engine would.
fn deploy(ledger: &FileLedger, env: &str, previous: &str, new: &str, outcome: Outcome) {
    let id = DeploymentId::from(format!("{env}-{new}"));
    let mut record = DeploymentRecord::pending(
        id.clone(),
        EnvironmentId::from(env),
        None,
        new.to_string(),
        Digest::from(format!("sha256:{new}")),
        Initiator::User("alice".to_string()),
    );
    record.previous_tag = Some(previous.to_string());
    ledger.append(record).expect("append");
    ledger
        .update_outcome(&id, outcome, Some("0123456789abcdef".to_string()), 1)
        .expect("settle");
}

#[test]
fn init_is_idempotent() {
    let home = TempDir::new().expect("home");

    updater_cmd(home.path())
        .arg("init")
        .assert()
        .success()
        .stdout(contains("Created"));
    assert!(config_path_at(home.path()).exists());

    updater_cmd(home.path())
        .arg("init")
        .assert()
        .success()
        .stdout(contains("already exists"));
}

#[test]
fn env_list_on_fresh_config_is_empty() {
    let home = TempDir::new().expect("home");
    updater_cmd(home.path()).arg("init").assert().success();

    updater_cmd(home.path())
        .args(["env", "list"])
        .assert()
        .success()
        .stdout(contains("No environments configured."));
}

#[test]
fn missing_config_points_at_init() {
    let home = TempDir::new().expect("home");
    updater_cmd(home.path())
        .args(["env", "list"])
        .assert()
        .failure()
        .stderr(contains("image-updater init"));
}

#[test]
fn env_list_json_resolves_defaults() {
    let home = TempDir::new().expect("home");
    write_config(home.path());

    let output = updater_cmd(home.path())
        .args(["env", "list", "--json"])
        .output()
        .expect("run");
    assert!(output.status.success());
    let rows: serde_json::Value = serde_json::from_slice(&output.stdout).expect("json");
    let rows = rows.as_array().expect("array");
    assert_eq!(rows.len(), 2);

    let staging = rows.iter().find(|r| r["id"] == "staging").expect("staging");
    assert_eq!(staging["image"], "docker.io/library/nginx");
    assert_eq!(staging["policy"], "semver");
    assert_eq!(staging["poll_interval_secs"], 120);

    let production = rows.iter().find(|r| r["id"] == "production").expect("production");
    assert_eq!(production["policy"], "lexical");
    assert_eq!(production["poll_interval_secs"], 600);
}

#[test]
fn env_show_reports_latest_deployment() {
    let home = TempDir::new().expect("home");
    write_config(home.path());
    let ledger = FileLedger::open(ledger_dir_at(home.path()));
    deploy(&ledger, "staging", "1.24.0", "1.25.1", Outcome::Succeeded);

    updater_cmd(home.path())
        .args(["env", "show", "staging"])
        .assert()
        .success()
        .stdout(contains("docker.io/library/nginx"))
        .stdout(contains("1.24.0 -> 1.25.1"));

    updater_cmd(home.path())
        .args(["env", "show", "qa"])
        .assert()
        .failure()
        .stderr(contains("unknown environment 'qa'"));
}

#[test]
fn history_lists_records_newest_first() {
    let home = TempDir::new().expect("home");
    write_config(home.path());
    let ledger = FileLedger::open(ledger_dir_at(home.path()));
    deploy(
        &ledger,
        "staging",
        "1.23.0",
        "1.24.0",
        Outcome::failed("push-failed: permission denied"),
    );
    deploy(&ledger, "staging", "1.24.0", "1.25.1", Outcome::Succeeded);

    let output = updater_cmd(home.path())
        .args(["history", "staging", "--json"])
        .output()
        .expect("run");
    assert!(output.status.success());
    let records: Vec<DeploymentRecord> = serde_json::from_slice(&output.stdout).expect("json");
    let tags: Vec<&str> = records.iter().map(|r| r.new_tag.as_str()).collect();
    assert_eq!(tags, vec!["1.25.1", "1.24.0"]);

    updater_cmd(home.path())
        .args(["history", "staging", "--limit", "1"])
        .assert()
        .success()
        .stdout(contains("1.24.0 -> 1.25.1"))
        .stdout(contains("1.23.0 -> 1.24.0").not());
}

#[test]
fn history_for_untouched_environment_is_empty() {
    let home = TempDir::new().expect("home");
    write_config(home.path());

    updater_cmd(home.path())
        .args(["history", "production"])
        .assert()
        .success()
        .stdout(contains("No deployments recorded for 'production'."));
}

#[test]
fn daemon_status_when_not_running() {
    let home = TempDir::new().expect("home");
    updater_cmd(home.path())
        .args(["daemon", "status"])
        .assert()
        .success()
        .stdout(contains("\"running\": false"));

    updater_cmd(home.path())
        .args(["daemon", "stop"])
        .assert()
        .success()
        .stdout(contains("daemon is not running"));
}

#[test]
fn deploy_and_webhook_need_the_daemon() {
    let home = TempDir::new().expect("home");
    write_config(home.path());

    updater_cmd(home.path())
        .args(["deploy", "staging"])
        .assert()
        .failure()
        .stderr(contains("daemon start"));

    updater_cmd(home.path())
        .args(["deploy", "staging", "--tag", "1.24.0"])
        .assert()
        .failure()
        .stderr(contains("daemon start"));

    updater_cmd(home.path())
        .args([
            "webhook",
            "--repository",
            "nginx",
            "--tag",
            "1.25.1",
            "--digest",
            "sha256:abc",
        ])
        .assert()
        .failure()
        .stderr(contains("daemon is not running"));
}

// ---------------------------------------------------------------------------
// Manifest lookups against a local git remote
// ---------------------------------------------------------------------------

fn git_available() -> bool {
    Command::new("git")
        .arg("--version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

fn git(dir: &Path, args: &[&str]) {
    let output = Command::new("git")
        .args(["-c", "commit.gpgsign=false"])
        .args(args)
        .current_dir(dir)
        .env("GIT_CONFIG_NOSYSTEM", "1")
        .env("GIT_AUTHOR_NAME", "Seed")
        .env("GIT_AUTHOR_EMAIL", "seed@example.com")
        .env("GIT_COMMITTER_NAME", "Seed")
        .env("GIT_COMMITTER_EMAIL", "seed@example.com")
        .output()
        .expect("spawn git");
    assert!(
        output.status.success(),
        "git {args:?} failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
}

/// Bare remote on `main` whose manifest was last touched by "bump web".
fn seeded_remote(root: &Path) -> PathBuf {
    let bare = root.join("remote.git");
    let seed = root.join("seed");
    fs::create_dir_all(&bare).expect("mkdir bare");
    fs::create_dir_all(seed.join("apps/web")).expect("mkdir seed");
    git(&bare, &["init", "--quiet", "--bare"]);
    git(&bare, &["symbolic-ref", "HEAD", "refs/heads/main"]);
    git(&seed, &["init", "--quiet"]);
    git(&seed, &["symbolic-ref", "HEAD", "refs/heads/main"]);

    let manifest = seed.join("apps/web/values.yaml");
    fs::write(&manifest, "image:\n  repository: nginx\n  tag: 1.24.0\n").expect("write");
    git(&seed, &["add", "."]);
    git(&seed, &["commit", "--quiet", "-m", "initial manifest"]);
    fs::write(&manifest, "image:\n  repository: nginx\n  tag: 1.25.1\n").expect("write");
    git(&seed, &["commit", "--quiet", "-am", "bump web"]);
    fs::write(seed.join("README.md"), "docs\n").expect("write");
    git(&seed, &["add", "README.md"]);
    git(&seed, &["commit", "--quiet", "-m", "docs only"]);

    git(&seed, &["remote", "add", "origin", bare.to_str().expect("utf8 path")]);
    git(&seed, &["push", "--quiet", "origin", "main"]);
    bare
}

#[test]
fn env_show_reads_manifest_and_last_change() {
    if !git_available() {
        eprintln!("Git not available, skipping test");
        return;
    }
    let home = TempDir::new().expect("home");
    let bare = seeded_remote(home.path());
    let config = format!(
        "\
version: 1
repositories:
  - id: deploy
    url: file://{}
    branch: main
environments:
  - id: staging
    application: web
    repository: deploy
    manifest_path: apps/web/values.yaml
    image: nginx
",
        bare.display()
    );
    let path = config_path_at(home.path());
    fs::create_dir_all(path.parent().expect("config dir")).expect("create config dir");
    fs::write(&path, config).expect("write config");

    updater_cmd(home.path())
        .args(["env", "show", "staging", "--manifest"])
        .assert()
        .success()
        .stdout(contains("declared:"))
        .stdout(contains("1.25.1"))
        .stdout(contains("bump web"));

    let output = updater_cmd(home.path())
        .args(["env", "show", "staging", "--manifest", "--json"])
        .output()
        .expect("run");
    assert!(output.status.success());
    let json: serde_json::Value = serde_json::from_slice(&output.stdout).expect("json");
    assert_eq!(json["manifest"]["tag"], "1.25.1");
    assert_eq!(json["manifest"]["last_change"]["summary"], "bump web");
    assert_eq!(json["manifest"]["last_change"]["author"], "Seed");
}
