use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::anyhow;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::{FromSql, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde_derive::{Deserialize, Serialize};
use uuid::Uuid;

/// Identity of a single run: 128 random bits rendered as 32 lowercase hex chars.
/// Used as the history primary key and as the run's directory name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RunId(String);

impl RunId {
    pub fn random() -> Self {
        Uuid::new_v4().into()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for RunId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let valid = s.len() == 32
            && s.bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        if !valid {
            return Err(anyhow!("Invalid run id {s:?}, expected 32 lowercase hex characters"));
        }
        Ok(Self(s.to_string()))
    }
}

impl From<Uuid> for RunId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid.simple().to_string())
    }
}

impl ToSql for RunId {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.0.as_str()))
    }
}

impl FromSql for RunId {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value.as_str().map(|s| Self(s.to_string()))
    }
}

/// One unit of work triggered from the console: a literal command vector,
/// where to run it, and which environment variables to overlay.
///
/// A job is never mutated after construction. Running the same command again
/// means building a new job, which gets a new [`RunId`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    name: String,
    argv: Vec<String>,
    cwd: PathBuf,
    env: BTreeMap<String, String>,
    run_id: RunId,
    created_at: DateTime<Utc>,
}

impl Job {
    pub fn new<I, S>(name: impl Into<String>, argv: I, cwd: impl Into<PathBuf>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::builder(name, argv, cwd).build()
    }

    pub fn builder<I, S>(name: impl Into<String>, argv: I, cwd: impl Into<PathBuf>) -> JobBuilder
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        JobBuilder {
            name: name.into(),
            argv: argv.into_iter().map(Into::into).collect(),
            cwd: cwd.into(),
            env: BTreeMap::new(),
            run_id: None,
            created_at: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn argv(&self) -> &[String] {
        &self.argv
    }

    pub fn cwd(&self) -> &Path {
        &self.cwd
    }

    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    /// Fixed-width RFC 3339 timestamp, so string order matches time order.
    pub fn created_at_iso(&self) -> String {
        self.created_at.to_rfc3339_opts(SecondsFormat::Micros, true)
    }
}

pub struct JobBuilder {
    name: String,
    argv: Vec<String>,
    cwd: PathBuf,
    env: BTreeMap<String, String>,
    run_id: Option<RunId>,
    created_at: Option<DateTime<Utc>>,
}

impl JobBuilder {
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn envs<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.env
            .extend(vars.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    pub fn run_id(mut self, run_id: RunId) -> Self {
        self.run_id = Some(run_id);
        self
    }

    pub fn created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = Some(created_at);
        self
    }

    pub fn build(self) -> Job {
        self.build_with(RunId::random)
    }

    /// Builds the job, drawing its identity from `next_id` unless one was set explicitly.
    pub fn build_with(self, next_id: impl FnOnce() -> RunId) -> Job {
        Job {
            name: self.name,
            argv: self.argv,
            cwd: self.cwd,
            env: self.env,
            run_id: self.run_id.unwrap_or_else(next_id),
            created_at: self.created_at.unwrap_or_else(Utc::now),
        }
    }
}

/// Outcome of a job whose process was launched and ran to termination.
/// A non-zero `exit_code` is still a result, not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobResult {
    pub run_id: RunId,
    pub exit_code: i32,
    pub stdout_path: PathBuf,
    pub stderr_path: PathBuf,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl JobResult {
    pub fn succeeded(&self) -> bool {
        self.exit_code == 0
    }
}
