//! Initialize the configuration directory: create ~/.funil, default config,
//! and the workspace with a seeded PERSONA.md.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use crate::config;

static DEFAULT_PERSONA: &str = include_str!("../config/workspace/PERSONA.md");

/// Ensure the configuration directory has been initialized (config file and
/// workspace directory exist).
pub fn require_initialized(config_path: &Path, config: &config::Config) -> Result<()> {
    if !config_path.exists() {
        anyhow::bail!(
            "configuration not initialized; run `funil init` first (config file not found: {})",
            config_path.display()
        );
    }
    let workspace = config::resolve_workspace_dir(config);
    match workspace {
        Some(dir) if dir.exists() => Ok(()),
        Some(dir) => anyhow::bail!(
            "configuration not initialized; run `funil init` first (workspace directory not found: {})",
            dir.display()
        ),
        None => anyhow::bail!("cannot resolve a workspace directory"),
    }
}

/// Create the config directory and default files if they do not exist.
/// - Creates the config directory (parent of config file path).
/// - Writes `config.json` with `{}` if missing.
/// - Creates the `workspace` subdirectory and seeds `PERSONA.md` from the
///   default template if missing.
pub fn init_config_dir(config_path: &Path) -> Result<PathBuf> {
    let config_dir = config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(config_dir)
        .with_context(|| format!("creating config directory {}", config_dir.display()))?;

    if !config_path.exists() {
        let default_config = b"{}";
        std::fs::write(config_path, default_config)
            .with_context(|| format!("writing default config to {}", config_path.display()))?;
        log::info!("created default config at {}", config_path.display());
    }

    let workspace = config_dir.join("workspace");
    if !workspace.exists() {
        std::fs::create_dir_all(&workspace)
            .with_context(|| format!("creating workspace directory {}", workspace.display()))?;
        log::info!("created workspace directory at {}", workspace.display());
    }
    // Seed a default PERSONA.md in the workspace if one does not exist yet.
    let workspace_persona = workspace.join("PERSONA.md");
    if !workspace_persona.exists() {
        std::fs::write(&workspace_persona, DEFAULT_PERSONA)
            .with_context(|| format!("writing default PERSONA.md to {}", workspace_persona.display()))?;
        log::info!("wrote default PERSONA.md to {}", workspace_persona.display());
    }

    Ok(config_dir.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_then_require_initialized_passes() {
        let dir = std::env::temp_dir().join(format!("funil-init-test-{}", uuid::Uuid::new_v4()));
        let config_path = dir.join("config.json");
        init_config_dir(&config_path).unwrap();
        assert!(config_path.exists());
        assert!(dir.join("workspace").join("PERSONA.md").exists());

        let mut config = config::Config::default();
        config.consultant.workspace = Some(dir.join("workspace"));
        require_initialized(&config_path, &config).unwrap();
    }

    #[test]
    fn uninitialized_directory_is_rejected() {
        let dir = std::env::temp_dir().join(format!("funil-init-test-{}", uuid::Uuid::new_v4()));
        let config = config::Config::default();
        assert!(require_initialized(&dir.join("config.json"), &config).is_err());
    }
}
