use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};

use chrono::Utc;
use tracing::debug;

use super::{Runner, RunnerError};
use crate::job::{Job, JobResult, RunId};

pub const STDOUT_LOG: &str = "stdout.log";
pub const STDERR_LOG: &str = "stderr.log";

/// Runs jobs as child processes of the control plane, capturing their
/// output under `<runs_dir>/<run_id>/`.
pub struct DirectRunner {
    runs_dir: PathBuf,
}

impl DirectRunner {
    pub fn new(runs_dir: impl Into<PathBuf>) -> Self {
        Self {
            runs_dir: runs_dir.into(),
        }
    }

    pub fn run_dir(&self, run_id: &RunId) -> PathBuf {
        self.runs_dir.join(run_id.as_str())
    }
}

impl Runner for DirectRunner {
    fn describe(&self) -> String {
        "Direct execution on control plane".to_string()
    }

    fn execute(&self, job: &Job) -> Result<JobResult, RunnerError> {
        let (program, args) = job.argv().split_first().ok_or(RunnerError::EmptyArgv)?;

        let run_dir = self.run_dir(job.run_id());
        fs::create_dir_all(&run_dir).map_err(|source| RunnerError::RunDir {
            path: run_dir.clone(),
            source,
        })?;

        let stdout_path = run_dir.join(STDOUT_LOG);
        let stderr_path = run_dir.join(STDERR_LOG);
        let stdout = create_log(&stdout_path)?;
        let stderr = create_log(&stderr_path)?;

        debug!(
            run_id = %job.run_id(),
            argv = ?job.argv(),
            cwd = %job.cwd().display(),
            "Launching job"
        );

        let started_at = Utc::now();
        // argv goes straight to exec, no shell in between
        let mut child = Command::new(program)
            .args(args)
            .current_dir(job.cwd())
            .envs(job.env())
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .spawn()
            .map_err(|source| RunnerError::Launch {
                program: program.clone(),
                cwd: job.cwd().to_path_buf(),
                source,
            })?;

        let status = child.wait().map_err(|source| RunnerError::Wait {
            program: program.clone(),
            source,
        })?;
        let finished_at = Utc::now();

        debug!(run_id = %job.run_id(), %status, "Job process exited");

        Ok(JobResult {
            run_id: job.run_id().clone(),
            exit_code: exit_code(status),
            stdout_path,
            stderr_path,
            started_at,
            finished_at,
        })
    }
}

fn create_log(path: &Path) -> Result<File, RunnerError> {
    File::create(path).map_err(|source| RunnerError::LogFile {
        path: path.to_path_buf(),
        source,
    })
}

/// Processes killed by a signal report the negated signal number.
fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return -signal;
        }
    }
    -1
}
