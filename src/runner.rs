pub mod direct;
pub mod gitops;

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use thiserror::Error;

use crate::config::{RunnerConfig, RunnerMode};
use crate::job::{Job, JobResult};

pub use direct::DirectRunner;
pub use gitops::GitOpsRunner;

/// Failures of the execution machinery itself. A job that ran and exited
/// non-zero is not one of these; it comes back as a [`JobResult`].
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("job has an empty argument vector")]
    EmptyArgv,

    #[error("failed to create run directory {path}: {source}")]
    RunDir { path: PathBuf, source: io::Error },

    #[error("failed to create log file {path}: {source}")]
    LogFile { path: PathBuf, source: io::Error },

    #[error("failed to launch {program:?} in {cwd}: {source}")]
    Launch {
        program: String,
        cwd: PathBuf,
        source: io::Error,
    },

    #[error("failed waiting for {program:?}: {source}")]
    Wait { program: String, source: io::Error },

    #[error("{0} not implemented yet")]
    NotImplemented(&'static str),

    #[error("runner crashed: {0}")]
    Crashed(String),
}

/// An execution strategy. `execute` blocks until the work is done and must
/// never be called on the coordination context.
pub trait Runner: Send + Sync {
    fn describe(&self) -> String;

    fn execute(&self, job: &Job) -> Result<JobResult, RunnerError>;
}

pub fn from_config(config: &RunnerConfig, runs_dir: &Path) -> Result<Arc<dyn Runner>> {
    let runner: Arc<dyn Runner> = match config.mode {
        RunnerMode::Direct => Arc::new(DirectRunner::new(runs_dir)),
        RunnerMode::Gitops => {
            let repo = config.gitops_repo_path.as_ref().ok_or(anyhow!(
                "runner.mode is gitops but runner.gitops_repo_path is not set"
            ))?;
            Arc::new(GitOpsRunner::new(repo))
        }
    };
    Ok(runner)
}
