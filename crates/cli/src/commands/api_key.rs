//! `flint api-key`

use colored::Colorize;
use flint_common::FlintConfig;
use std::path::Path;

use crate::output::{print_info, print_warning};

pub fn execute(config_path: &Path) -> anyhow::Result<()> {
    let config = FlintConfig::load(config_path)?;

    if config.api_key.is_empty() {
        print_warning("No API key has been generated yet.");
        print_info("Run `flint serve` once to create one.");
        return Ok(());
    }

    println!("{}", config.api_key.bold());
    println!();
    println!("{}", usage_line(&config.api_key));
    Ok(())
}

fn usage_line(key: &str) -> String {
    format!("Use it in API requests as:  Authorization: Bearer {}", key)
}
