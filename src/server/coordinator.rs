use std::collections::HashSet;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;
use tracing::{error, info, warn};

use crate::db::HistoryStore;
use crate::ipc::{CliToConsole, ConsoleToCli};
use crate::job::{Job, JobResult, RunId};
use crate::logging::LogSink;
use crate::runner::{Runner, RunnerError};

/// Everything that reaches the console goes through this one inbox, so
/// console state is only ever touched from the task draining it.
pub enum ConsoleEvent {
    Finished {
        job: Job,
        outcome: Result<JobResult, RunnerError>,
    },
    Request {
        request: CliToConsole,
        reply: oneshot::Sender<ConsoleToCli>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Exited(i32),
    LaunchFailed(String),
}

/// What the operator is told when a run completes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobNotice {
    pub run_id: RunId,
    pub job_name: String,
    pub outcome: Outcome,
}

impl JobNotice {
    pub fn succeeded(&self) -> bool {
        self.outcome == Outcome::Exited(0)
    }

    pub fn summary(&self) -> String {
        match &self.outcome {
            Outcome::Exited(0) => format!("{}: success (exit code 0)", self.job_name),
            Outcome::Exited(code) => format!("{}: failed (exit code {code})", self.job_name),
            Outcome::LaunchFailed(e) => format!("{}: could not be launched ({e})", self.job_name),
        }
    }
}

pub struct Coordinator {
    runner: Arc<dyn Runner>,
    history: Arc<HistoryStore>,
    sink: LogSink,
    inbox: UnboundedSender<ConsoleEvent>,
    in_flight: HashSet<RunId>,
}

impl Coordinator {
    pub fn new(
        runner: Arc<dyn Runner>,
        history: Arc<HistoryStore>,
        sink: LogSink,
    ) -> (Self, UnboundedReceiver<ConsoleEvent>) {
        let (inbox, rx) = mpsc::unbounded_channel();
        let coordinator = Self {
            runner,
            history,
            sink,
            inbox,
            in_flight: HashSet::new(),
        };
        (coordinator, rx)
    }

    /// Handle for other producers (socket clients) to post into the same inbox.
    pub fn inbox(&self) -> UnboundedSender<ConsoleEvent> {
        self.inbox.clone()
    }

    pub fn describe_runner(&self) -> String {
        self.runner.describe()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Records the run as started and hands it to a blocking worker.
    /// Returns as soon as the job is dispatched. If the start cannot be
    /// recorded the job is not launched.
    ///
    /// Must be called from within a tokio runtime.
    pub fn submit_job(&mut self, job: Job) -> Result<RunId> {
        if let Err(e) = self.history.record_started(&job) {
            let msg = format!("{e:#}");
            error!(run_id = %job.run_id(), job = job.name(), error = %msg, "Failed to record job start");
            self.sink
                .line(format!("{}: not started, history unavailable ({msg})", job.name()));
            return Err(e.context(format!("Failed to record start of {}", job.name())));
        }

        let run_id = job.run_id().clone();
        self.in_flight.insert(run_id.clone());
        info!(run_id = %run_id, job = job.name(), "Job submitted");
        self.sink
            .line(format!("Started {} (run {run_id})", job.name()));

        let runner = Arc::clone(&self.runner);
        let inbox = self.inbox.clone();
        tokio::task::spawn_blocking(move || {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| runner.execute(&job)))
                .unwrap_or_else(|payload| Err(RunnerError::Crashed(panic_message(&*payload))));
            if inbox.send(ConsoleEvent::Finished { job, outcome }).is_err() {
                warn!("Console inbox closed before job completion was delivered");
            }
        });

        Ok(run_id)
    }

    /// Applies a completion on the coordination context. A completion for a
    /// run that is not in flight is ignored, so each run is finished at most once.
    pub fn on_finished(
        &mut self,
        job: Job,
        outcome: Result<JobResult, RunnerError>,
    ) -> Option<JobNotice> {
        if !self.in_flight.remove(job.run_id()) {
            warn!(run_id = %job.run_id(), "Ignoring completion for a run that is not in flight");
            return None;
        }

        let outcome = match outcome {
            Ok(result) => {
                if let Err(e) = self.history.record_finished(&job, &result) {
                    let e = format!("{e:#}");
                    error!(run_id = %job.run_id(), error = %e, "Failed to record job completion");
                    self.sink
                        .line(format!("History update failed for run {}: {e}", job.run_id()));
                }
                info!(
                    run_id = %result.run_id,
                    exit_code = result.exit_code,
                    succeeded = result.succeeded(),
                    elapsed_ms = (result.finished_at - result.started_at).num_milliseconds(),
                    job = job.name(),
                    "Job finished"
                );
                Outcome::Exited(result.exit_code)
            }
            Err(e) => {
                // the history row stays `running`; nothing sweeps it
                error!(run_id = %job.run_id(), job = job.name(), error = %e, "Job could not be launched");
                Outcome::LaunchFailed(e.to_string())
            }
        };

        let notice = JobNotice {
            run_id: job.run_id().clone(),
            job_name: job.name().to_string(),
            outcome,
        };
        self.sink.line(notice.summary());

        Some(notice)
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
