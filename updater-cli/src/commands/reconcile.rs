//! `image-updater reconcile <env>`: one awaited run in this process.

use anyhow::{bail, Context, Result};
use clap::Args;
use colored::Colorize;

use updater_core::{EnvironmentId, Initiator, Outcome};
use updater_engine::{EngineError, Intent, ReconcileReport};

#[derive(Args, Debug)]
pub struct ReconcileArgs {
    /// Environment id.
    pub environment: String,

    /// Deploy this tag instead of the policy's choice; older tags roll back.
    #[arg(long)]
    pub tag: Option<String>,

    /// Name recorded as the initiator; defaults to $USER.
    #[arg(long)]
    pub user: Option<String>,

    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

impl ReconcileArgs {
    pub fn run(self) -> Result<()> {
        let home = super::home()?;
        let settings = super::load_settings(&home)?;
        let engine = super::build_engine(&home, &settings)?;
        let id = EnvironmentId::from(self.environment.as_str());
        let initiator = Initiator::User(super::current_user(self.user));

        let intent = match self.tag {
            Some(tag) => Intent::Pin { tag },
            None => Intent::Latest { hint: None },
        };

        let report = match super::block_on(engine.run_intent(&id, initiator, intent))? {
            Ok(report) => report,
            Err(EngineError::AlreadyInProgress(_)) => {
                println!("{} reconciliation already in progress for '{id}'", "!".yellow());
                return Ok(());
            }
            Err(err) => return Err(err).with_context(|| format!("reconcile failed for '{id}'")),
        };

        if self.json {
            super::print_json(&report)?;
        } else {
            print_report(&report);
        }
        check(report)
    }
}

fn print_report(report: &ReconcileReport) {
    match report {
        ReconcileReport::UpToDate { environment, tag, .. } => {
            println!("{} '{environment}' is up to date at {tag}", "✓".green());
        }
        ReconcileReport::Recorded { record } => match &record.outcome {
            Outcome::Succeeded => println!(
                "{} '{}' updated {} -> {} (commit {}, {} attempt(s))",
                "✓".green(),
                record.environment,
                record.previous_tag.as_deref().unwrap_or("-"),
                record.new_tag.green().bold(),
                record
                    .commit
                    .as_deref()
                    .map(|c| super::short(c, 7))
                    .unwrap_or_else(|| "-".to_string()),
                record.attempts,
            ),
            Outcome::ConflictRetried => println!(
                "'{}' was changed concurrently; {} already superseded, nothing committed",
                record.environment, record.new_tag
            ),
            Outcome::Failed { .. } | Outcome::Pending => {}
        },
        ReconcileReport::EvaluationFailed { .. } => {}
    }
}

/// Non-zero exit for runs that did not reach a good end state.
fn check(report: ReconcileReport) -> Result<()> {
    match report {
        ReconcileReport::Recorded { record } => match record.outcome {
            Outcome::Failed { reason } => {
                bail!("deployment {} of '{}' failed: {reason}", record.id, record.environment)
            }
            Outcome::Pending => bail!("deployment {} was left pending", record.id),
            Outcome::Succeeded | Outcome::ConflictRetried => Ok(()),
        },
        ReconcileReport::EvaluationFailed {
            environment,
            kind,
            message,
        } => bail!("evaluation of '{environment}' failed ({kind}): {message}"),
        ReconcileReport::UpToDate { .. } => Ok(()),
    }
}
