use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde_derive::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub proxmox: ProxmoxConfig,
    pub runner: RunnerConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxmoxConfig {
    /// Single node or every member of a cluster, e.g. `https://pve1:8006`.
    pub endpoints: Vec<String>,
    pub verify_tls: bool,
}

impl Default for ProxmoxConfig {
    fn default() -> Self {
        Self {
            endpoints: Vec::new(),
            verify_tls: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    pub mode: RunnerMode,
    pub gitops_repo_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunnerMode {
    #[default]
    Direct,
    Gitops,
}

impl AppConfig {
    /// Reads `config.yml`, writing the defaults there first if it does not exist yet.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            let config = Self::default();
            config.save(path)?;
            return Ok(config);
        }

        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        let config = serde_yaml::from_str(&text)
            .with_context(|| format!("Invalid config {}", path.display()))?;

        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let text = serde_yaml::to_string(self)?;
        fs::write(path, text).with_context(|| format!("Failed to write config {}", path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::scratch_dir;

    #[test]
    fn missing_config_is_written_with_defaults() {
        let dir = scratch_dir("config_default");
        let path = dir.join("config").join("config.yml");

        let config = AppConfig::load(&path).unwrap();
        assert_eq!(config, AppConfig::default());
        assert_eq!(config.runner.mode, RunnerMode::Direct);
        assert!(config.proxmox.verify_tls);

        let written = fs::read_to_string(&path).unwrap();
        assert!(written.contains("mode: direct"));
        assert_eq!(AppConfig::load(&path).unwrap(), config);

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn partial_config_fills_in_defaults() {
        let dir = scratch_dir("config_partial");
        let path = dir.join("config.yml");
        fs::write(
            &path,
            "proxmox:\n  endpoints:\n    - https://pve1:8006\n    - https://pve2:8006\nrunner:\n  mode: gitops\n  gitops_repo_path: /srv/gitops\n",
        )
        .unwrap();

        let config = AppConfig::load(&path).unwrap();
        assert_eq!(config.proxmox.endpoints.len(), 2);
        assert!(config.proxmox.verify_tls);
        assert_eq!(config.runner.mode, RunnerMode::Gitops);
        assert_eq!(config.runner.gitops_repo_path, Some(PathBuf::from("/srv/gitops")));

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn empty_file_means_defaults() {
        let dir = scratch_dir("config_empty");
        let path = dir.join("config.yml");
        fs::write(&path, "\n").unwrap();

        assert_eq!(AppConfig::load(&path).unwrap(), AppConfig::default());

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn unknown_runner_mode_is_rejected() {
        let dir = scratch_dir("config_bad_mode");
        let path = dir.join("config.yml");
        fs::write(&path, "runner:\n  mode: kubernetes\n").unwrap();

        let err = AppConfig::load(&path).unwrap_err();
        assert!(format!("{err:#}").contains("kubernetes"));

        let _ = fs::remove_dir_all(&dir);
    }
}
