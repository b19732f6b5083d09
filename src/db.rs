use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, ensure, Context, Result};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ValueRef};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_derive::{Deserialize, Serialize};

use crate::job::{Job, JobResult, RunId};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Success,
    Failed,
}

impl RunStatus {
    pub fn from_exit_code(exit_code: i32) -> Self {
        if exit_code == 0 {
            Self::Success
        } else {
            Self::Failed
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "running" => Ok(Self::Running),
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            other => Err(anyhow!("Unknown run status {other:?}")),
        }
    }
}

impl FromSql for RunStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e: anyhow::Error| FromSqlError::Other(e.into()))
    }
}

/// One row of the `runs` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: RunId,
    pub created_at_utc: String,
    pub job_name: String,
    pub status: RunStatus,
    pub exit_code: i32,
    pub stdout_path: String,
    pub stderr_path: String,
}

impl RunRecord {
    pub fn from_row(r: &Row) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            run_id: r.get(0)?,
            created_at_utc: r.get(1)?,
            job_name: r.get(2)?,
            status: r.get(3)?,
            exit_code: r.get(4)?,
            stdout_path: r.get(5)?,
            stderr_path: r.get(6)?,
        })
    }
}

/// Run history kept in a SQLite file.
///
/// Every call opens its own connection and finishes in a single statement,
/// so the store can be shared freely between the console and job workers.
#[derive(Debug, Clone)]
pub struct HistoryStore {
    path: PathBuf,
}

impl HistoryStore {
    /// Opens (creating if needed) the database at `path` and applies the schema.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        let store = Self { path };
        let conn = store.connect()?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
            row.get::<_, String>(0)
        })?;
        conn.execute_batch(include_str!("./init.sql"))?;

        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn connect(&self) -> Result<Connection> {
        let conn = Connection::open(&self.path)
            .with_context(|| format!("Failed to open history database {}", self.path.display()))?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        Ok(conn)
    }

    /// Inserts the job as `running`, replacing any row with the same run id.
    pub fn record_started(&self, job: &Job) -> Result<()> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare_cached(
            "INSERT OR REPLACE INTO runs
             (run_id, created_at_utc, job_name, status, exit_code, stdout_path, stderr_path)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )?;
        stmt.execute(params![
            job.run_id(),
            job.created_at_iso(),
            job.name(),
            RunStatus::Running.as_str(),
            -1,
            "",
            "",
        ])?;

        Ok(())
    }

    /// Writes the final outcome of a run. Returns the number of rows updated,
    /// which is 0 when the run was never recorded as started.
    pub fn record_finished(&self, job: &Job, result: &JobResult) -> Result<usize> {
        ensure!(
            job.run_id() == &result.run_id,
            "Result for run {} does not belong to job run {}",
            result.run_id,
            job.run_id()
        );

        let conn = self.connect()?;
        let mut stmt = conn.prepare_cached(
            "UPDATE runs
             SET status = ?, exit_code = ?, stdout_path = ?, stderr_path = ?
             WHERE run_id = ?",
        )?;
        let updated = stmt.execute(params![
            RunStatus::from_exit_code(result.exit_code).as_str(),
            result.exit_code,
            result.stdout_path.to_string_lossy().into_owned(),
            result.stderr_path.to_string_lossy().into_owned(),
            result.run_id,
        ])?;

        Ok(updated)
    }

    /// Most recent runs first, at most `limit` of them.
    pub fn latest(&self, limit: usize) -> Result<Vec<RunRecord>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare_cached(
            "SELECT run_id, created_at_utc, job_name, status, exit_code, stdout_path, stderr_path
             FROM runs
             ORDER BY created_at_utc DESC, run_id DESC
             LIMIT ?",
        )?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let records = stmt
            .query_map([limit], RunRecord::from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(records)
    }

    pub fn get(&self, run_id: &RunId) -> Result<Option<RunRecord>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare_cached(
            "SELECT run_id, created_at_utc, job_name, status, exit_code, stdout_path, stderr_path
             FROM runs
             WHERE run_id = ?",
        )?;
        let record = stmt.query_row([run_id], RunRecord::from_row).optional()?;

        Ok(record)
    }
}
