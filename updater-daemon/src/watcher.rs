//! Config file watcher with trailing-edge debounce.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify::{recommended_watcher, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use updater_core::config::load_settings_at;
use updater_engine::ReconciliationEngine;

use crate::error::{io_err, DaemonError};
use crate::paths::{config_file_name, updater_root, DEBOUNCE_WINDOW};

/// Fires once the event stream has been quiet for the window.
#[derive(Debug, Clone)]
pub(crate) struct Debounce {
    window: Duration,
    deadline: Option<Instant>,
}

impl Debounce {
    pub(crate) fn new(window: Duration) -> Self {
        Self {
            window,
            deadline: None,
        }
    }

    /// Record an event; pushes the deadline out.
    pub(crate) fn touch(&mut self, now: Instant) {
        self.deadline = Some(now + self.window);
    }

    pub(crate) fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Consume the pending fire if its deadline has passed.
    pub(crate) fn fire(&mut self, now: Instant) -> bool {
        match self.deadline {
            Some(deadline) if now >= deadline => {
                self.deadline = None;
                true
            }
            _ => false,
        }
    }
}

pub(crate) async fn watcher_task(
    home: PathBuf,
    engine: Arc<ReconciliationEngine>,
    reload_tx: mpsc::Sender<()>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let root = updater_root(&home);
    if !root.exists() {
        fs::create_dir_all(&root).map_err(|e| io_err(&root, e))?;
    }
    // Events arrive with canonical paths on some platforms.
    let root = fs::canonicalize(&root).unwrap_or(root);

    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<notify::Result<Event>>();
    let mut watcher: RecommendedWatcher = recommended_watcher(move |event| {
        let _ = event_tx.send(event);
    })?;
    // The file is replaced by rename on save, so watch its directory.
    watcher.watch(&root, RecursiveMode::NonRecursive)?;
    tracing::debug!(path = %root.display(), "watching config directory");

    let mut debounce = Debounce::new(DEBOUNCE_WINDOW);

    loop {
        let deadline = debounce.deadline();
        let quiet = async move {
            match deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = quiet => {
                if debounce.fire(Instant::now()) {
                    reload(&home, &engine, &reload_tx).await?;
                }
            }
            event = event_rx.recv() => {
                let Some(event) = event else { break };
                let event = match event {
                    Ok(event) => event,
                    Err(err) => {
                        tracing::warn!(error = %err, "watcher event error");
                        continue;
                    }
                };
                if is_relevant_event_kind(&event.kind)
                    && event.paths.iter().any(|path| is_config_file(path))
                {
                    debounce.touch(Instant::now());
                }
            }
        }
    }

    Ok(())
}

/// Reload settings and swap the environment set. A broken config keeps the
/// previous set running.
async fn reload(
    home: &Path,
    engine: &Arc<ReconciliationEngine>,
    reload_tx: &mpsc::Sender<()>,
) -> Result<(), DaemonError> {
    let home_for_load = home.to_path_buf();
    let loaded = tokio::task::spawn_blocking(move || load_settings_at(&home_for_load))
        .await
        .map_err(|err| DaemonError::Protocol(format!("config reload join error: {err}")))?;

    match loaded {
        Ok(settings) => {
            tracing::info!(
                environments = settings.environments.len(),
                "config changed, reloading environments",
            );
            engine.replace_environments(settings.environments);
            reload_tx
                .send(())
                .await
                .map_err(|_| DaemonError::ChannelClosed("reload queue"))?;
        }
        Err(err) => {
            tracing::warn!(error = %err, "config reload failed, keeping current environments");
        }
    }
    Ok(())
}

fn is_relevant_event_kind(kind: &EventKind) -> bool {
    matches!(kind, EventKind::Create(_) | EventKind::Modify(_))
}

fn is_config_file(path: &Path) -> bool {
    path.file_name().and_then(|name| name.to_str()) == Some(config_file_name())
}
