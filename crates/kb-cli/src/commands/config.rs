//! Config command implementations

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::output::{print_info, print_success, print_warning};
use kb_core::config::{self, ConfigFile};

/// Print the effective configuration as TOML
pub fn config_show(config: &ConfigFile) -> Result<()> {
    let content = toml::to_string_pretty(config).context("Failed to serialize config")?;
    print!("{}", content);
    Ok(())
}

/// Write a default config file
pub fn config_init(config_path: Option<&Path>, force: bool) -> Result<()> {
    let path: PathBuf = config_path
        .map(Path::to_path_buf)
        .unwrap_or_else(config::default_config_path);

    if path.exists() && !force {
        print_warning(&format!("Config file already exists: {:?}", path));
        print_info("Use --force to overwrite");
        return Ok(());
    }

    config::save_config(&path, &ConfigFile::default())
        .with_context(|| format!("Failed to write config to {:?}", path))?;
    print_success(&format!("Wrote default configuration to {:?}", path));
    Ok(())
}
