//! Configuration commands.

use std::path::Path;

use anyhow::{Context, Result};
use weft_config::WeftConfig;

/// Print the effective configuration as TOML.
pub fn show(project: &str) -> Result<()> {
    let config = load(project)?;
    let text = toml::to_string_pretty(&config).context("Failed to render configuration")?;
    print!("{text}");
    Ok(())
}

/// Load every layer and report whether the result is usable.
pub fn validate(project: &str) -> Result<()> {
    let project_path = Path::new(project);
    println!("Validating configuration in {}...", project_path.display());

    match load(project) {
        Ok(_) => {
            println!("✓ Configuration is valid");
            Ok(())
        }
        Err(e) => {
            println!("✗ Configuration validation failed:");
            println!("  {e:#}");
            Err(e)
        }
    }
}

pub(crate) fn load(project: &str) -> Result<WeftConfig> {
    WeftConfig::load_from_dir(project).context("Failed to load configuration")
}
