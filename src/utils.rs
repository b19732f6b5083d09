use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use directories::BaseDirs;

pub const APP_DIR_NAME: &str = "fouchger_homelab";

/// Where the console keeps everything it owns. All of it lives under one
/// root so the control plane can be backed up or restored as a unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppPaths {
    pub root: PathBuf,
    pub config_dir: PathBuf,
    pub state_dir: PathBuf,
    pub logs_dir: PathBuf,
    pub runs_dir: PathBuf,
}

impl AppPaths {
    pub fn from_root(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            config_dir: root.join("config"),
            state_dir: root.join("state"),
            logs_dir: root.join("logs"),
            runs_dir: root.join("runs"),
            root,
        }
    }

    /// `$HOME/app/<app_dir_name>`
    pub fn from_home(app_dir_name: &str) -> Result<Self> {
        let dirs = BaseDirs::new().ok_or(anyhow!("Failed to locate home directory"))?;
        Ok(Self::from_root(dirs.home_dir().join("app").join(app_dir_name)))
    }

    pub fn resolve(root: Option<PathBuf>) -> Result<Self> {
        match root {
            Some(root) => Ok(Self::from_root(root)),
            None => Self::from_home(APP_DIR_NAME),
        }
    }

    pub fn ensure(&self) -> Result<()> {
        for dir in [
            &self.root,
            &self.config_dir,
            &self.state_dir,
            &self.logs_dir,
            &self.runs_dir,
        ] {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
        }
        Ok(())
    }

    pub fn config_file(&self) -> PathBuf {
        self.config_dir.join("config.yml")
    }

    pub fn history_db(&self) -> PathBuf {
        self.state_dir.join("history.db")
    }

    pub fn log_file(&self) -> PathBuf {
        self.logs_dir.join("app.log")
    }

    pub fn run_dir(&self, run_id: &str) -> PathBuf {
        self.runs_dir.join(run_id)
    }

    pub fn socket_path(&self) -> PathBuf {
        self.state_dir.join("console.sock")
    }
}

#[cfg(test)]
pub fn scratch_dir(prefix: &str) -> PathBuf {
    let base = std::env::temp_dir();
    let pid = std::process::id();
    let nonce = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let dir = base.join(format!("homelab_{prefix}_{pid}_{nonce}"));
    std::fs::create_dir_all(&dir).expect("create temp dir");
    dir
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_hangs_off_root() {
        let paths = AppPaths::from_root("/srv/homelab");
        assert_eq!(paths.config_file(), PathBuf::from("/srv/homelab/config/config.yml"));
        assert_eq!(paths.history_db(), PathBuf::from("/srv/homelab/state/history.db"));
        assert_eq!(paths.log_file(), PathBuf::from("/srv/homelab/logs/app.log"));
        assert_eq!(paths.run_dir("abc"), PathBuf::from("/srv/homelab/runs/abc"));
    }

    #[test]
    fn ensure_creates_every_directory() {
        let dir = scratch_dir("paths_ensure");
        let paths = AppPaths::from_root(dir.join("root"));

        paths.ensure().unwrap();
        paths.ensure().unwrap();

        for d in [&paths.config_dir, &paths.state_dir, &paths.logs_dir, &paths.runs_dir] {
            assert!(d.is_dir(), "{} missing", d.display());
        }

        let _ = std::fs::remove_dir_all(&dir);
    }
}
