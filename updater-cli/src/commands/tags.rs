//! `image-updater tags <env>`

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;

use updater_core::EnvironmentId;

#[derive(Args, Debug)]
pub struct TagsArgs {
    /// Environment id.
    pub environment: String,

    /// Show at most this many tags.
    #[arg(long, short = 'n', default_value_t = 20)]
    pub limit: usize,

    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

impl TagsArgs {
    pub fn run(self) -> Result<()> {
        let home = super::home()?;
        let settings = super::load_settings(&home)?;
        let engine = super::build_engine(&home, &settings)?;
        let id = EnvironmentId::from(self.environment.as_str());

        let mut tags = super::block_on(engine.list_tags(&id))?
            .with_context(|| format!("failed to list tags for '{id}'"))?;
        tags.truncate(self.limit);

        if self.json {
            return super::print_json(&tags);
        }
        if tags.is_empty() {
            println!("No tags found for '{id}'.");
            return Ok(());
        }
        for (i, tag) in tags.iter().enumerate() {
            if i == 0 {
                println!("{} {}", tag.green().bold(), "(newest)".bright_black());
            } else {
                println!("{tag}");
            }
        }
        Ok(())
    }
}
