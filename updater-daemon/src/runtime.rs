use std::fs;
use std::io::ErrorKind;
use std::os::unix::net::UnixStream as StdUnixStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, mpsc};

use updater_core::config::{ledger_dir_at, load_settings_at};
use updater_core::{EnvironmentId, Initiator};
use updater_engine::{EngineOptions, FileLedger, ReconciliationEngine};
use updater_registry::HttpRegistryClient;
use updater_repo::{GitCli, GitIdentity};

use crate::error::{io_err, DaemonError};
use crate::intake;
use crate::paths::{socket_path, updater_root};
use crate::protocol::{DaemonRequest, DaemonResponse};
use crate::scheduler::Scheduler;
use crate::watcher::watcher_task;

/// Initiator name for a manual deploy that did not say who asked.
const UNKNOWN_USER: &str = "unknown";

/// Start the daemon runtime and block the current thread until it exits.
pub fn start_blocking(home: &Path) -> Result<(), DaemonError> {
    init_tracing();
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| io_err("tokio-runtime", e))?;
    runtime.block_on(run(home.to_path_buf()))
}

/// Build the production engine from `~/.image-updater/config.yaml` and serve.
pub async fn run(home: PathBuf) -> Result<(), DaemonError> {
    let settings = load_settings_at(&home)?;

    let registry = Arc::new(HttpRegistryClient::from_settings(&settings)?);
    let repo = Arc::new(GitCli::new(GitIdentity {
        name: settings.git.author_name.clone(),
        email: settings.git.author_email.clone(),
    }));
    let ledger = Arc::new(FileLedger::open(ledger_dir_at(&home)));
    let engine = Arc::new(ReconciliationEngine::new(
        registry,
        repo,
        ledger,
        EngineOptions::from_settings(&settings),
        settings.environments.clone(),
    ));

    let recovered = engine.recover_interrupted()?;
    if recovered > 0 {
        tracing::warn!(recovered, "failed deployments left pending by a previous run");
    }
    tracing::info!(
        environments = settings.environments.len(),
        registries = settings.registries.len(),
        "image-updater daemon starting",
    );

    serve(home, engine).await
}

/// Run the socket server, poll scheduler, config watcher and signal handler
/// until any of them asks for shutdown.
pub async fn serve(home: PathBuf, engine: Arc<ReconciliationEngine>) -> Result<(), DaemonError> {
    ensure_runtime_dirs(&home)?;
    let started_at = Utc::now();

    let (reload_tx, reload_rx) = mpsc::channel::<()>(8);
    let (shutdown_tx, _) = broadcast::channel::<()>(16);

    let watcher_handle = {
        let shutdown = shutdown_tx.clone();
        let home = home.clone();
        let engine = engine.clone();
        tokio::spawn(async move {
            let result = watcher_task(home, engine, reload_tx, shutdown.subscribe()).await;
            let _ = shutdown.send(());
            result
        })
    };

    let scheduler_handle = {
        let shutdown = shutdown_tx.clone();
        let engine = engine.clone();
        tokio::spawn(async move {
            let result = scheduler_task(engine, reload_rx, shutdown.subscribe()).await;
            let _ = shutdown.send(());
            result
        })
    };

    let socket_handle = {
        let shutdown = shutdown_tx.clone();
        let home = home.clone();
        let engine = engine.clone();
        tokio::spawn(async move {
            let result = socket_server_task(
                home,
                engine,
                shutdown.clone(),
                shutdown.subscribe(),
                started_at,
            )
            .await;
            let _ = shutdown.send(());
            result
        })
    };

    let signal_handle = {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            let mut shutdown_rx = shutdown.subscribe();
            tokio::select! {
                _ = shutdown_rx.recv() => Ok(()),
                signal = tokio::signal::ctrl_c() => {
                    match signal {
                        Ok(()) => {
                            tracing::info!("received ctrl-c, shutting down daemon");
                            let _ = shutdown.send(());
                            Ok(())
                        }
                        Err(err) => Err(DaemonError::Protocol(format!("ctrl-c handler failed: {err}"))),
                    }
                }
            }
        })
    };

    let (watcher_result, scheduler_result, socket_result, signal_result) = tokio::join!(
        watcher_handle,
        scheduler_handle,
        socket_handle,
        signal_handle
    );

    handle_join("watcher", watcher_result)?;
    handle_join("scheduler", scheduler_result)?;
    handle_join("socket_server", socket_result)?;
    handle_join("signal_handler", signal_result)?;
    tracing::info!("image-updater daemon stopped");
    Ok(())
}

async fn scheduler_task(
    engine: Arc<ReconciliationEngine>,
    mut reload_rx: mpsc::Receiver<()>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let mut scheduler = Scheduler::new(engine);
    scheduler.respawn();

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            reload = reload_rx.recv() => {
                let Some(()) = reload else { break };
                scheduler.respawn();
            }
        }
    }

    scheduler.stop();
    Ok(())
}

async fn socket_server_task(
    home: PathBuf,
    engine: Arc<ReconciliationEngine>,
    shutdown_tx: broadcast::Sender<()>,
    mut shutdown_rx: broadcast::Receiver<()>,
    started_at: DateTime<Utc>,
) -> Result<(), DaemonError> {
    let socket = socket_path(&home);
    prepare_socket_for_bind(&socket)?;

    let listener = UnixListener::bind(&socket).map_err(|e| io_err(&socket, e))?;
    set_socket_permissions(&socket)?;
    tracing::info!(socket = %socket.display(), "listening");

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            accepted = listener.accept() => {
                let (stream, _) = accepted.map_err(|e| io_err(&socket, e))?;
                let home = home.clone();
                let engine = engine.clone();
                let shutdown_tx = shutdown_tx.clone();
                tokio::spawn(async move {
                    if let Err(err) = handle_socket_client(stream, home, engine, shutdown_tx, started_at).await {
                        tracing::error!(error = %err, "socket client error");
                    }
                });
            }
        }
    }

    if socket.exists() {
        let _ = fs::remove_file(&socket);
    }
    Ok(())
}

async fn handle_socket_client(
    stream: UnixStream,
    home: PathBuf,
    engine: Arc<ReconciliationEngine>,
    shutdown_tx: broadcast::Sender<()>,
    started_at: DateTime<Utc>,
) -> Result<(), DaemonError> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines
        .next_line()
        .await
        .map_err(|e| io_err("daemon socket read", e))?
    {
        if line.trim().is_empty() {
            continue;
        }

        let request = match serde_json::from_str::<DaemonRequest>(&line) {
            Ok(request) => request,
            Err(err) => {
                write_response(
                    &mut writer,
                    &DaemonResponse::error(format!("invalid request: {err}")),
                )
                .await?;
                continue;
            }
        };
        tracing::debug!(cmd = request.name(), "socket request");

        let stop = matches!(request, DaemonRequest::Stop);
        let response = match request {
            DaemonRequest::Status => {
                let engine = engine.clone();
                let home = home.clone();
                match tokio::task::spawn_blocking(move || {
                    build_status_payload(&home, &engine, started_at)
                })
                .await
                {
                    Ok(payload) => DaemonResponse::ok(payload),
                    Err(err) => DaemonResponse::error(format!("status task failed: {err}")),
                }
            }
            DaemonRequest::Reconcile {
                environment,
                user,
                tag,
            } => {
                let initiator =
                    Initiator::User(user.unwrap_or_else(|| UNKNOWN_USER.to_string()));
                let triggered = match &tag {
                    Some(tag) => engine.try_deploy_tag(&environment, initiator, tag.clone()),
                    None => engine.try_reconcile(&environment, initiator, None),
                };
                match triggered {
                    Ok(status) => DaemonResponse::ok(json!({
                        "environment": environment,
                        "tag": tag,
                        "status": status,
                    })),
                    Err(err) => DaemonResponse::error(err.to_string()),
                }
            }
            DaemonRequest::Webhook { notification } => {
                let triggered = intake::dispatch(&engine, &notification);
                DaemonResponse::ok(json!({ "triggered": triggered }))
            }
            DaemonRequest::History { environment, limit } => {
                match history(engine.clone(), environment, limit).await {
                    Ok(records) => DaemonResponse::ok(records),
                    Err(err) => DaemonResponse::error(err.to_string()),
                }
            }
            DaemonRequest::Stop => {
                let _ = shutdown_tx.send(());
                DaemonResponse::ok(json!({ "stopping": true }))
            }
        };

        write_response(&mut writer, &response).await?;
        if stop {
            break;
        }
    }

    Ok(())
}

async fn history(
    engine: Arc<ReconciliationEngine>,
    environment: EnvironmentId,
    limit: Option<usize>,
) -> Result<Value, DaemonError> {
    let records = tokio::task::spawn_blocking(move || engine.history(&environment, limit))
        .await
        .map_err(|err| DaemonError::Protocol(format!("history task join error: {err}")))??;
    Ok(serde_json::to_value(records)?)
}

/// Daemon-wide status with one entry per tracked environment.
pub(crate) fn build_status_payload(
    home: &Path,
    engine: &ReconciliationEngine,
    started_at: DateTime<Utc>,
) -> Value {
    let environments: Vec<Value> = engine
        .environments()
        .into_iter()
        .map(|env| {
            let last = match engine.history(&env.id, Some(1)) {
                Ok(mut records) => records.pop(),
                Err(err) => {
                    tracing::warn!(environment = %env.id, error = %err, "history unavailable for status");
                    None
                }
            };
            json!({
                "id": env.id,
                "image": env.image.to_string(),
                "phase": engine.status(&env.id),
                "current_tag": env.current.as_ref().map(|c| c.tag.clone()),
                "poll_interval_secs": env.poll_interval.as_secs(),
                "last_outcome": last.as_ref().map(|r| r.outcome.label()),
                "last_tag": last.as_ref().map(|r| r.new_tag.clone()),
                "last_updated_at": last.as_ref().map(|r| r.updated_at.to_rfc3339()),
                "last_error": engine
                    .last_failure(&env.id)
                    .map(|f| format!("{}: {}", f.kind, f.message)),
            })
        })
        .collect();

    json!({
        "running": true,
        "started_at": started_at.to_rfc3339(),
        "socket": socket_path(home).display().to_string(),
        "environments": environments,
    })
}

fn prepare_socket_for_bind(socket: &Path) -> Result<(), DaemonError> {
    if !socket.exists() {
        return Ok(());
    }

    match StdUnixStream::connect(socket) {
        Ok(_) => {
            return Err(DaemonError::Protocol(format!(
                "daemon socket already in use: {}",
                socket.display()
            )));
        }
        Err(err) => {
            tracing::warn!(
                socket = %socket.display(),
                error = %err,
                "removing stale daemon socket before bind",
            );
        }
    }

    match fs::remove_file(socket) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(io_err(socket, err)),
    }
}

fn ensure_runtime_dirs(home: &Path) -> Result<(), DaemonError> {
    let root = updater_root(home);
    if !root.exists() {
        fs::create_dir_all(&root).map_err(|e| io_err(&root, e))?;
    }
    let ledger = ledger_dir_at(home);
    if !ledger.exists() {
        fs::create_dir_all(&ledger).map_err(|e| io_err(&ledger, e))?;
    }
    Ok(())
}

async fn write_response(
    writer: &mut OwnedWriteHalf,
    response: &DaemonResponse,
) -> Result<(), DaemonError> {
    let payload = serde_json::to_string(response)?;
    writer
        .write_all(payload.as_bytes())
        .await
        .map_err(|e| io_err("daemon socket write", e))?;
    writer
        .write_all(b"\n")
        .await
        .map_err(|e| io_err("daemon socket write", e))?;
    writer
        .flush()
        .await
        .map_err(|e| io_err("daemon socket flush", e))?;
    Ok(())
}

fn handle_join(
    task: &str,
    result: Result<Result<(), DaemonError>, tokio::task::JoinError>,
) -> Result<(), DaemonError> {
    match result {
        Ok(inner) => inner,
        Err(err) => Err(DaemonError::Protocol(format!(
            "{task} task join failure: {err}"
        ))),
    }
}

/// `RUST_LOG`-driven subscriber; `info` when unset.
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[cfg(unix)]
fn set_socket_permissions(path: &Path) -> Result<(), DaemonError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600)).map_err(|e| io_err(path, e))
}

#[cfg(not(unix))]
fn set_socket_permissions(_path: &Path) -> Result<(), DaemonError> {
    Ok(())
}
