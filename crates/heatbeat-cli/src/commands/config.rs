//! Config command implementation.

use std::path::Path;

use anyhow::{Context, Result, bail};

use crate::cli::ConfigAction;
use crate::config::Config;

pub fn cmd_config(action: ConfigAction, config: &Config, path: &Path) -> Result<()> {
    match action {
        ConfigAction::Path => println!("{}", path.display()),
        ConfigAction::Show => {
            let mut shown = config.clone();
            if shown.token.is_some() {
                shown.token = Some("********".to_string());
            }
            print!(
                "{}",
                toml::to_string_pretty(&shown).context("Failed to serialize config")?
            );
        }
        ConfigAction::Init { force } => {
            if path.exists() && !force {
                bail!(
                    "Config file already exists at {} (use --force to overwrite)",
                    path.display()
                );
            }
            Config::default().save(path)?;
            println!("Wrote {}", path.display());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_init_writes_defaults_and_refuses_overwrite() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("heatbeat").join("config.toml");

        cmd_config(ConfigAction::Init { force: false }, &Config::default(), &path).unwrap();
        assert_eq!(Config::load(&path).unwrap(), Config::default());

        let err = cmd_config(ConfigAction::Init { force: false }, &Config::default(), &path)
            .unwrap_err();
        assert!(err.to_string().contains("already exists"));

        cmd_config(ConfigAction::Init { force: true }, &Config::default(), &path).unwrap();
    }
}
