//! `image-updater deploy <env> [--tag <tag>]`: manual deploy through the daemon.

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;

use updater_core::EnvironmentId;
use updater_daemon::{request_reconcile, DaemonError};

#[derive(Args, Debug)]
pub struct DeployArgs {
    /// Environment id.
    pub environment: String,

    /// Deploy this tag instead of the policy's choice; older tags roll back.
    #[arg(long)]
    pub tag: Option<String>,

    /// Name recorded as the initiator; defaults to $USER.
    #[arg(long)]
    pub user: Option<String>,
}

impl DeployArgs {
    pub fn run(self) -> Result<()> {
        let home = super::home()?;
        let id = EnvironmentId::from(self.environment.as_str());
        let user = super::current_user(self.user);

        let answer = match request_reconcile(&home, id.clone(), Some(user), self.tag.clone()) {
            Ok(answer) => answer,
            Err(err @ DaemonError::DaemonNotRunning { .. }) => {
                return Err(err).context(
                    "daemon is not running; start it with `image-updater daemon start` \
                     or use `image-updater reconcile`",
                )
            }
            Err(err) => return Err(err).with_context(|| format!("deploy of '{id}' failed")),
        };

        match answer["status"].as_str() {
            Some("accepted") => println!(
                "{} deploy of '{id}'{} accepted; follow it with `image-updater history {id}`",
                "✓".green(),
                self.tag.map(|t| format!(" at {t}")).unwrap_or_default(),
            ),
            Some("already_in_progress") => {
                println!("{} reconciliation already in progress for '{id}'", "!".yellow())
            }
            _ => super::print_json(&answer)?,
        }
        Ok(())
    }
}
