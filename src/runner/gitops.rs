use std::path::PathBuf;

use super::{Runner, RunnerError};
use crate::job::{Job, JobResult};

/// Deferred execution: write the desired change into a repository
/// workspace, push it, and let CI apply it and report back.
///
/// Only the shape exists so far; every execution is refused.
pub struct GitOpsRunner {
    repo_path: PathBuf,
}

impl GitOpsRunner {
    pub fn new(repo_path: impl Into<PathBuf>) -> Self {
        Self {
            repo_path: repo_path.into(),
        }
    }
}

impl Runner for GitOpsRunner {
    fn describe(&self) -> String {
        format!("GitOps execution via repo: {}", self.repo_path.display())
    }

    fn execute(&self, _job: &Job) -> Result<JobResult, RunnerError> {
        Err(RunnerError::NotImplemented("GitOps runner"))
    }
}
