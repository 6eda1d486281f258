//! Subcommand implementations and the helpers they share.

pub mod daemon;
pub mod deploy;
pub mod env;
pub mod history;
pub mod init;
pub mod plan;
pub mod reconcile;
pub mod tags;
pub mod webhook;

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;

use updater_core::config::{ledger_dir_at, load_settings_at};
use updater_core::Settings;
use updater_engine::{EngineOptions, FileLedger, ReconciliationEngine};
use updater_registry::HttpRegistryClient;
use updater_repo::{GitCli, GitIdentity};

pub fn home() -> Result<PathBuf> {
    dirs::home_dir().context("could not determine home directory")
}

pub fn load_settings(home: &Path) -> Result<Settings> {
    load_settings_at(home).context("failed to load configuration")
}

/// Engine wired to the real registry, git and on-disk ledger.
pub fn build_engine(home: &Path, settings: &Settings) -> Result<Arc<ReconciliationEngine>> {
    let registry =
        HttpRegistryClient::from_settings(settings).context("failed to set up registry client")?;
    let repo = GitCli::new(GitIdentity {
        name: settings.git.author_name.clone(),
        email: settings.git.author_email.clone(),
    });
    Ok(Arc::new(ReconciliationEngine::new(
        Arc::new(registry),
        Arc::new(repo),
        Arc::new(FileLedger::open(ledger_dir_at(home))),
        EngineOptions::from_settings(settings),
        settings.environments.clone(),
    )))
}

/// Drive one async engine call to completion.
pub fn block_on<F: Future>(future: F) -> Result<F::Output> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")?;
    Ok(runtime.block_on(future))
}

/// Name recorded as the initiator of a manual deploy.
pub fn current_user(explicit: Option<String>) -> String {
    explicit
        .or_else(|| std::env::var("USER").ok())
        .or_else(|| std::env::var("USERNAME").ok())
        .filter(|name| !name.trim().is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}

pub fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("failed to serialize JSON output")?
    );
    Ok(())
}

/// Diagnostics go to stderr so `--json` output stays clean.
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

pub fn short(id: &str, len: usize) -> String {
    id.chars().take(len).collect()
}
