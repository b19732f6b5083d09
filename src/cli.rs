pub mod ipc;

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::Args;

use crate::catalog::Tool;
use crate::config::AppConfig;
use crate::db::{HistoryStore, RunRecord};
use crate::ipc::{socket_name, CliToConsole, ConsoleToCli, JobRequest};
use crate::job::RunId;
use crate::runner::{self, direct};
use crate::server::{self, coordinator::JobNotice};
use crate::utils::AppPaths;

#[derive(Args, Debug)]
pub struct JobArgs {
    /// Label shown in history; defaults to the command line
    #[arg(long)]
    pub name: Option<String>,
    /// Working directory; defaults to the current one
    #[arg(long)]
    pub cwd: Option<PathBuf>,
    /// Extra environment for the job, overriding inherited values
    #[arg(long = "env", value_name = "KEY=VALUE", value_parser = parse_env)]
    pub env: Vec<(String, String)>,
    #[arg(required = true, last = true)]
    pub argv: Vec<String>,
}

fn parse_env(s: &str) -> Result<(String, String)> {
    let (k, v) = s
        .split_once('=')
        .ok_or(anyhow!("Expected KEY=VALUE, got {s:?}"))?;
    if k.is_empty() {
        return Err(anyhow!("Empty variable name in {s:?}"));
    }
    Ok((k.to_string(), v.to_string()))
}

impl JobArgs {
    fn into_request(self) -> Result<JobRequest> {
        let here = std::env::current_dir()?;
        // the console may run elsewhere, so send an absolute directory
        let cwd = match self.cwd {
            Some(cwd) if cwd.is_absolute() => cwd,
            Some(cwd) => here.join(cwd),
            None => here,
        };
        Ok(JobRequest {
            name: self.name.unwrap_or_else(|| self.argv.join(" ")),
            argv: self.argv,
            cwd,
            env: self.env.into_iter().collect::<BTreeMap<_, _>>(),
        })
    }
}

/// Summaries were already printed by the console; this only tallies them.
fn report(notices: &[JobNotice]) -> bool {
    let failed = notices.iter().filter(|n| !n.succeeded()).count();
    if failed > 0 {
        eprintln!("{failed} of {} job(s) failed", notices.len());
    }
    failed == 0
}

pub fn run(paths: &AppPaths, config: &AppConfig, args: JobArgs) -> Result<bool> {
    let job = args.into_request()?.into_job();
    let notices = server::run_jobs(paths, config, vec![job])?;
    Ok(report(&notices))
}

pub fn preflight(paths: &AppPaths, config: &AppConfig, tool: Tool) -> Result<bool> {
    let notices = server::run_jobs(paths, config, tool.jobs(&paths.root))?;
    Ok(report(&notices))
}

pub fn submit(paths: &AppPaths, args: JobArgs) -> Result<()> {
    let job = args.into_request()?;
    match ipc::send_command(&socket_name(paths), CliToConsole::Submit { job })? {
        ConsoleToCli::Submitted { run_id } => {
            println!("Submitted run {run_id}");
            Ok(())
        }
        ConsoleToCli::Error { e } => Err(anyhow!("Console refused the job: {e}")),
        res => Err(anyhow!("Unexpected response from console: {res:?}")),
    }
}

pub fn checks() {
    for tool in Tool::ALL {
        println!("{}", tool.title());
        for check in tool.checks() {
            println!("  {:<28} {}", check.name, check.argv.join(" "));
        }
    }
}

pub fn history(paths: &AppPaths, limit: usize, json: bool) -> Result<()> {
    let records = HistoryStore::open(paths.history_db())?.latest(limit)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(());
    }
    if records.is_empty() {
        println!("No runs recorded yet");
        return Ok(());
    }

    println!("{:<27} {:<8} {:>5}  {:<32}  JOB", "CREATED (UTC)", "STATUS", "EXIT", "RUN");
    for r in &records {
        println!(
            "{:<27} {:<8} {:>5}  {:<32}  {}",
            r.created_at_utc,
            r.status.as_str(),
            r.exit_code,
            r.run_id.as_str(),
            r.job_name
        );
    }
    Ok(())
}

/// Where the captured output of `record` lives. Rows still marked running
/// have no paths yet, but the direct runner's layout is known.
fn log_path(paths: &AppPaths, record: &RunRecord, stderr: bool) -> PathBuf {
    let recorded = if stderr { &record.stderr_path } else { &record.stdout_path };
    if !recorded.is_empty() {
        return PathBuf::from(recorded);
    }
    let file = if stderr { direct::STDERR_LOG } else { direct::STDOUT_LOG };
    paths.run_dir(record.run_id.as_str()).join(file)
}

pub fn show(paths: &AppPaths, run_id: &str, stderr: bool) -> Result<()> {
    let run_id: RunId = run_id.parse()?;
    let record = HistoryStore::open(paths.history_db())?
        .get(&run_id)?
        .ok_or(anyhow!("No run {run_id} in history"))?;

    println!("run:     {}", record.run_id);
    println!("job:     {}", record.job_name);
    println!("created: {}", record.created_at_utc);
    println!("status:  {} (exit code {})", record.status, record.exit_code);

    let log = log_path(paths, &record, stderr);
    println!("log:     {}", log.display());
    println!();
    print!("{}", read_log(&log)?);
    Ok(())
}

fn read_log(path: &Path) -> Result<String> {
    match fs::read(path) {
        Ok(bytes) => Ok(String::from_utf8_lossy(&bytes).into_owned()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok("(no output captured)\n".into()),
        Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
    }
}

pub fn show_config(paths: &AppPaths, config: &AppConfig) -> Result<()> {
    println!("# {}", paths.config_file().display());
    print!("{}", serde_yaml::to_string(config)?);
    println!("# runner: {}", runner::from_config(&config.runner, &paths.runs_dir)?.describe());
    Ok(())
}
