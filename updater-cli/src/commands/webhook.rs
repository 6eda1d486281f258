//! `image-updater webhook`: hand a registry push notification to the daemon.

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;

use updater_core::Digest;
use updater_daemon::{request_webhook, Dispatched, Notification, DaemonError};
use updater_engine::TriggerStatus;

#[derive(Args, Debug)]
pub struct WebhookArgs {
    /// Image namespace, e.g. `library` or `acme`.
    #[arg(long, default_value = "")]
    pub namespace: String,

    /// Image name, or `namespace/name`.
    #[arg(long)]
    pub repository: String,

    /// Tag that was pushed.
    #[arg(long)]
    pub tag: String,

    /// Digest of the pushed image.
    #[arg(long)]
    pub digest: String,

    /// Registry host; any registry matches when omitted.
    #[arg(long)]
    pub registry: Option<String>,
}

impl WebhookArgs {
    pub fn run(self) -> Result<()> {
        let home = super::home()?;
        let notification = Notification {
            namespace: self.namespace,
            repository: self.repository,
            tag: self.tag,
            digest: Digest::from(self.digest),
            registry: self.registry,
        };

        let data = match request_webhook(&home, notification) {
            Ok(data) => data,
            Err(err @ DaemonError::DaemonNotRunning { .. }) => {
                return Err(err)
                    .context("daemon is not running; start it with `image-updater daemon start`")
            }
            Err(err) => return Err(err).context("webhook delivery failed"),
        };
        let triggered: Vec<Dispatched> = serde_json::from_value(data["triggered"].clone())
            .context("unexpected webhook response from daemon")?;

        if triggered.is_empty() {
            println!("No environment tracks this image.");
            return Ok(());
        }
        for entry in triggered {
            let status = match entry.status {
                TriggerStatus::Accepted => "accepted".green(),
                TriggerStatus::AlreadyInProgress => "already in progress".yellow(),
            };
            println!("{}: {status}", entry.environment);
        }
        Ok(())
    }
}
