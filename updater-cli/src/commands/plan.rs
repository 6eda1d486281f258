//! `image-updater plan <env>`: a dry run that prints the manifest diff.

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;

use updater_core::EnvironmentId;

#[derive(Args, Debug)]
pub struct PlanArgs {
    /// Environment id.
    pub environment: String,

    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

impl PlanArgs {
    pub fn run(self) -> Result<()> {
        let home = super::home()?;
        let settings = super::load_settings(&home)?;
        let engine = super::build_engine(&home, &settings)?;
        let id = EnvironmentId::from(self.environment.as_str());

        let plan = super::block_on(engine.plan(&id))?
            .with_context(|| format!("plan failed for '{id}'"))?;

        if self.json {
            return super::print_json(&plan);
        }

        let deployed = match &plan.deployed_digest {
            Some(digest) => format!("{} ({})", plan.deployed_tag, super::short(digest.as_str(), 19)),
            None => plan.deployed_tag.clone(),
        };
        match &plan.change {
            None => println!("{} '{}' is up to date at {deployed}", "✓".green(), plan.environment),
            Some(change) => {
                println!(
                    "'{}': {deployed} -> {}",
                    plan.environment,
                    change.tag.green().bold()
                );
                println!("commit message: {}", change.message);
                println!();
                print_diff(&change.unified_diff);
            }
        }
        Ok(())
    }
}

fn print_diff(diff: &str) {
    for line in diff.lines() {
        if line.starts_with("+++") || line.starts_with("---") {
            println!("{}", line.bold());
        } else if line.starts_with('+') {
            println!("{}", line.green());
        } else if line.starts_with('-') {
            println!("{}", line.red());
        } else if line.starts_with("@@") {
            println!("{}", line.cyan());
        } else {
            println!("{line}");
        }
    }
}
