//! `image-updater init`

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;

use updater_core::config::{config_path_at, init_at};

/// Write a starter configuration file.
#[derive(Args, Debug)]
pub struct InitArgs {}

impl InitArgs {
    pub fn run(self) -> Result<()> {
        let home = super::home()?;
        let path = config_path_at(&home);
        let (config, created) = init_at(&home)
            .with_context(|| format!("failed to initialize {}", path.display()))?;

        if created {
            println!("{} Created {}", "✓".green(), path.display());
            println!("  Add registries, repositories and environments, then run `image-updater env list`.");
        } else {
            println!(
                "Config already exists at {} ({} environments)",
                path.display(),
                config.environments.len()
            );
        }
        Ok(())
    }
}
