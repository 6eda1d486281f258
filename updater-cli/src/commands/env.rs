//! `image-updater env list|show`

use std::path::Path;

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use colored::Colorize;
use serde::Serialize;
use tabled::{settings::Style, Table, Tabled};

use updater_core::config::ledger_dir_at;
use updater_core::{Environment, EnvironmentId, Settings};
use updater_engine::{DeploymentLedger, FileLedger, ManifestInfo};

#[derive(Subcommand, Debug)]
pub enum EnvCommand {
    /// List configured environments.
    List(EnvListArgs),
    /// Show one environment and its latest deployment.
    ///
    /// With `--manifest`, also clone the repository and show what the
    /// manifest declares and the last commit that touched it.
    Show(EnvShowArgs),
}

#[derive(Args, Debug)]
pub struct EnvListArgs {
    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug)]
pub struct EnvShowArgs {
    /// Environment id.
    pub environment: String,

    /// Read the manifest from the repository as well.
    #[arg(long)]
    pub manifest: bool,

    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

#[derive(Serialize)]
struct EnvironmentJson {
    id: String,
    application: String,
    image: String,
    policy: String,
    repository: String,
    branch: String,
    manifest_path: String,
    tag_path: String,
    poll_interval_secs: u64,
}

impl From<&Environment> for EnvironmentJson {
    fn from(env: &Environment) -> Self {
        Self {
            id: env.id.to_string(),
            application: env.application.clone(),
            image: env.image.to_string(),
            policy: env.policy.to_string(),
            repository: env.repository.url.clone(),
            branch: env.repository.branch.clone(),
            manifest_path: env.manifest_path.display().to_string(),
            tag_path: env.schema.tag_path.clone(),
            poll_interval_secs: env.poll_interval.as_secs(),
        }
    }
}

#[derive(Tabled)]
struct EnvironmentRow {
    #[tabled(rename = "environment")]
    id: String,
    #[tabled(rename = "application")]
    application: String,
    #[tabled(rename = "image")]
    image: String,
    #[tabled(rename = "policy")]
    policy: String,
    #[tabled(rename = "manifest")]
    manifest: String,
    #[tabled(rename = "poll")]
    poll: String,
}

pub fn run(command: EnvCommand) -> Result<()> {
    match command {
        EnvCommand::List(args) => list(args),
        EnvCommand::Show(args) => show(args),
    }
}

fn list(args: EnvListArgs) -> Result<()> {
    let home = super::home()?;
    let settings = super::load_settings(&home)?;

    if args.json {
        let rows: Vec<EnvironmentJson> =
            settings.environments.iter().map(EnvironmentJson::from).collect();
        return super::print_json(&rows);
    }

    if settings.environments.is_empty() {
        println!("No environments configured.");
        return Ok(());
    }

    let rows: Vec<EnvironmentRow> = settings
        .environments
        .iter()
        .map(|env| EnvironmentRow {
            id: env.id.to_string(),
            application: env.application.clone(),
            image: env.image.to_string(),
            policy: env.policy.to_string(),
            manifest: format!(
                "{}@{}:{}",
                env.repository.branch,
                env.manifest_path.display(),
                env.schema.tag_path
            ),
            poll: format!("{}s", env.poll_interval.as_secs()),
        })
        .collect();
    let mut table = Table::new(rows);
    table.with(Style::rounded());
    println!("{table}");
    Ok(())
}

fn show(args: EnvShowArgs) -> Result<()> {
    let home = super::home()?;
    let settings = super::load_settings(&home)?;
    let id = EnvironmentId::from(args.environment.as_str());
    let env = settings
        .environment(&id)
        .with_context(|| format!("unknown environment '{id}'"))?;

    let ledger = FileLedger::open(ledger_dir_at(&home));
    let latest = ledger
        .list_by_environment(&id)
        .with_context(|| format!("failed to read deployment history for '{id}'"))?
        .into_iter()
        .next();

    let manifest = if args.manifest {
        Some(read_manifest(&home, &settings, &id)?)
    } else {
        None
    };

    if args.json {
        return super::print_json(&serde_json::json!({
            "environment": EnvironmentJson::from(env),
            "latest_deployment": latest,
            "manifest": manifest,
        }));
    }

    println!("{}", env.id.to_string().bold());
    println!("  application:  {}", env.application);
    println!("  image:        {}", env.image);
    println!("  policy:       {}", env.policy);
    println!("  repository:   {} ({})", env.repository.url, env.repository.branch);
    println!("  manifest:     {}", env.manifest_path.display());
    println!("  tag path:     {}", env.schema.tag_path);
    if let Some(digest_path) = &env.schema.digest_path {
        println!("  digest path:  {digest_path}");
    }
    println!("  poll every:   {}s", env.poll_interval.as_secs());

    match latest {
        Some(record) => println!(
            "  last deploy:  {} -> {} {} ({})",
            record.previous_tag.as_deref().unwrap_or("-"),
            record.new_tag,
            super::history::outcome_label(&record.outcome),
            record.updated_at.format("%Y-%m-%d %H:%M:%S UTC"),
        ),
        None => println!("  last deploy:  {}", "never".bright_black()),
    }

    if let Some(info) = manifest {
        match &info.digest {
            Some(digest) => println!(
                "  declared:     {} ({})",
                info.tag.bold(),
                super::short(digest.as_str(), 19)
            ),
            None => println!("  declared:     {}", info.tag.bold()),
        }
        match info.last_change {
            Some(change) => println!(
                "  changed in:   {} {}{}",
                super::short(&change.commit, 7),
                change.summary.as_deref().unwrap_or(""),
                change
                    .at
                    .map(|at| format!(" ({})", at.format("%Y-%m-%d %H:%M:%S UTC")))
                    .unwrap_or_default(),
            ),
            None => println!(
                "  changed in:   {}",
                "not within the configured history depth".bright_black()
            ),
        }
    }
    Ok(())
}

fn read_manifest(home: &Path, settings: &Settings, id: &EnvironmentId) -> Result<ManifestInfo> {
    let engine = super::build_engine(home, settings)?;
    super::block_on(engine.manifest_info(id))?
        .with_context(|| format!("failed to read the manifest of '{id}'"))
}
