//! image-updater: keeps GitOps manifests pointed at the newest container image.
//!
//! # Usage
//!
//! ```text
//! image-updater init
//! image-updater env list|show <env> [--json]
//! image-updater tags <env> [--limit N] [--json]
//! image-updater plan <env> [--json]
//! image-updater reconcile <env> [--user <name>] [--json]
//! image-updater history <env> [--limit N] [--json]
//! image-updater deploy <env> [--user <name>]
//! image-updater webhook --namespace <ns> --repository <repo> --tag <tag> --digest <digest>
//! image-updater daemon start|stop|status
//! ```

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};

use commands::{
    daemon::DaemonCommand, deploy::DeployArgs, env::EnvCommand, history::HistoryArgs,
    init::InitArgs, plan::PlanArgs, reconcile::ReconcileArgs, tags::TagsArgs,
    webhook::WebhookArgs,
};

// ---------------------------------------------------------------------------
// CLI entry point
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "image-updater",
    version,
    about = "Reconcile container image tags in GitOps repositories",
    long_about = None,
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Write a starter ~/.image-updater/config.yaml.
    Init(InitArgs),

    /// Inspect configured environments.
    Env {
        #[command(subcommand)]
        command: EnvCommand,
    },

    /// List registry tags for an environment's image, best first.
    Tags(TagsArgs),

    /// Show what a reconciliation would commit, without committing.
    Plan(PlanArgs),

    /// Reconcile an environment in this process and wait for the outcome.
    Reconcile(ReconcileArgs),

    /// Show deployment records for an environment, newest first.
    History(HistoryArgs),

    /// Ask the running daemon to reconcile an environment.
    Deploy(DeployArgs),

    /// Forward a registry push notification to the running daemon.
    Webhook(WebhookArgs),

    /// Run or control the background daemon.
    Daemon {
        #[command(subcommand)]
        command: DaemonCommand,
    },
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() -> Result<()> {
    let cli = Cli::parse();
    // The daemon installs its own subscriber.
    if !matches!(
        cli.command,
        Commands::Daemon {
            command: DaemonCommand::Start
        }
    ) {
        commands::init_tracing();
    }

    match cli.command {
        Commands::Init(args) => args.run(),
        Commands::Env { command } => commands::env::run(command),
        Commands::Tags(args) => args.run(),
        Commands::Plan(args) => args.run(),
        Commands::Reconcile(args) => args.run(),
        Commands::History(args) => args.run(),
        Commands::Deploy(args) => args.run(),
        Commands::Webhook(args) => args.run(),
        Commands::Daemon { command } => commands::daemon::run(command),
    }
}
