//! `image-updater history <env>`

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use tabled::{settings::Style, Table, Tabled};

use updater_core::config::ledger_dir_at;
use updater_core::{EnvironmentId, Outcome};
use updater_engine::{DeploymentLedger, FileLedger};

/// Read the local deployment ledger; the daemon does not need to be running.
#[derive(Args, Debug)]
pub struct HistoryArgs {
    /// Environment id.
    pub environment: String,

    /// Show at most this many records.
    #[arg(long, short = 'n')]
    pub limit: Option<usize>,

    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

#[derive(Tabled)]
struct HistoryRow {
    #[tabled(rename = "deployment")]
    id: String,
    #[tabled(rename = "when")]
    created_at: String,
    #[tabled(rename = "initiator")]
    initiator: String,
    #[tabled(rename = "change")]
    change: String,
    #[tabled(rename = "outcome")]
    outcome: String,
    #[tabled(rename = "commit")]
    commit: String,
    #[tabled(rename = "attempts")]
    attempts: u32,
}

impl HistoryArgs {
    pub fn run(self) -> Result<()> {
        let home = super::home()?;
        let id = EnvironmentId::from(self.environment.as_str());
        let ledger = FileLedger::open(ledger_dir_at(&home));
        let mut records = ledger
            .list_by_environment(&id)
            .with_context(|| format!("failed to read deployment history for '{id}'"))?;
        if let Some(limit) = self.limit {
            records.truncate(limit);
        }

        if self.json {
            return super::print_json(&records);
        }

        if records.is_empty() {
            println!("No deployments recorded for '{id}'.");
            return Ok(());
        }

        let rows: Vec<HistoryRow> = records
            .into_iter()
            .map(|record| HistoryRow {
                id: super::short(&record.id.to_string(), 8),
                created_at: record.created_at.format("%Y-%m-%d %H:%M:%S").to_string(),
                initiator: record.initiator.to_string(),
                change: format!(
                    "{} -> {}",
                    record.previous_tag.as_deref().unwrap_or("-"),
                    record.new_tag
                ),
                outcome: outcome_label(&record.outcome),
                commit: record
                    .commit
                    .as_deref()
                    .map(|c| super::short(c, 7))
                    .unwrap_or_else(|| "-".to_string()),
                attempts: record.attempts,
            })
            .collect();
        let mut table = Table::new(rows);
        table.with(Style::rounded());
        println!("{table}");
        Ok(())
    }
}

pub(crate) fn outcome_label(outcome: &Outcome) -> String {
    match outcome {
        Outcome::Pending => "pending".yellow().to_string(),
        Outcome::Succeeded => "succeeded".green().to_string(),
        Outcome::Failed { reason } => format!("{} ({reason})", "failed".red()),
        Outcome::ConflictRetried => "conflict-retried".bright_black().to_string(),
    }
}
