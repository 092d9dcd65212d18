//! CLI configuration stored in `~/.confluence/cli.toml`.

use anyhow::{Context, Result};
use clap::Subcommand;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::output::{self, OutputFormat};

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Set the server URL used when --api-url is not given
    SetUrl {
        url: String,
    },

    /// Show the stored configuration
    Show,

    /// Remove the stored configuration
    Reset {
        /// Skip confirmation
        #[arg(short, long)]
        force: bool,
    },
}

#[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CliConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_url: Option<String>,
}

impl CliConfig {
    fn path() -> Result<PathBuf> {
        let home = dirs::home_dir().context("Could not determine home directory")?;
        Ok(home.join(".confluence").join("cli.toml"))
    }

    /// Defaults when the file does not exist.
    fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content =
            std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
    }

    fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, content).with_context(|| format!("Failed to write {}", path.display()))
    }
}

/// The stored server URL, if any.
pub fn load_api_url() -> Option<String> {
    CliConfig::path()
        .and_then(|p| CliConfig::load_from(&p))
        .ok()
        .and_then(|cfg| cfg.api_url)
}

pub async fn execute(cmd: ConfigCommands, format: OutputFormat) -> Result<()> {
    let path = CliConfig::path()?;

    match cmd {
        ConfigCommands::SetUrl { url } => {
            anyhow::ensure!(
                url.starts_with("http://") || url.starts_with("https://"),
                "URL must start with http:// or https://"
            );
            let mut cfg = CliConfig::load_from(&path)?;
            cfg.api_url = Some(url.trim_end_matches('/').to_string());
            cfg.save_to(&path)?;
            match format {
                OutputFormat::Table => output::print_success(&format!("api-url saved to {}", path.display())),
                _ => output::print_item(&cfg, format)?,
            }
        }

        ConfigCommands::Show => {
            let cfg = CliConfig::load_from(&path)?;
            match format {
                OutputFormat::Table => {
                    output::print_header("Configuration");
                    output::print_detail("File", &path.display().to_string());
                    output::print_detail("api-url", cfg.api_url.as_deref().unwrap_or("(unset)"));
                }
                _ => output::print_item(&cfg, format)?,
            }
        }

        ConfigCommands::Reset { force } => {
            if !force {
                output::print_info("This will remove the CLI configuration. Use --force to confirm.");
                return Ok(());
            }
            if path.exists() {
                std::fs::remove_file(&path).with_context(|| format!("Failed to remove {}", path.display()))?;
            }
            output::print_success("Configuration reset to defaults");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_loads_defaults() {
        let cfg = CliConfig::load_from(Path::new("/nonexistent/confluence/cli.toml")).unwrap();
        assert_eq!(cfg, CliConfig::default());
    }

    #[test]
    fn test_save_then_load() {
        let dir = std::env::temp_dir().join(format!("confluence-cli-{}", uuid::Uuid::new_v4()));
        let path = dir.join("cli.toml");
        let cfg = CliConfig {
            api_url: Some("http://sync.internal:8080".into()),
        };
        cfg.save_to(&path).unwrap();
        assert_eq!(CliConfig::load_from(&path).unwrap(), cfg);
        std::fs::remove_dir_all(dir).unwrap();
    }
}
