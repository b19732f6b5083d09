pub mod coordinator;
pub mod listener;

use std::future::Future;
use std::io::Write;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::AppConfig;
use crate::db::HistoryStore;
use crate::ipc::{socket_name, CliToConsole, ConsoleToCli};
use crate::job::Job;
use crate::logging::LogSink;
use crate::runner;
use crate::utils::AppPaths;

use coordinator::{ConsoleEvent, Coordinator, JobNotice, Outcome};

/// The coordination context: owns the coordinator and applies every inbox event.
pub struct Console {
    coordinator: Coordinator,
}

impl Console {
    pub fn new(
        paths: &AppPaths,
        config: &AppConfig,
        sink: LogSink,
    ) -> Result<(Self, UnboundedReceiver<ConsoleEvent>)> {
        let runner = runner::from_config(&config.runner, &paths.runs_dir)?;
        let history = Arc::new(HistoryStore::open(paths.history_db())?);
        debug!(db = %history.path().display(), runner = %runner.describe(), "Console state ready");
        let (coordinator, inbox) = Coordinator::new(runner, history, sink);
        Ok((Self { coordinator }, inbox))
    }

    pub fn inbox(&self) -> UnboundedSender<ConsoleEvent> {
        self.coordinator.inbox()
    }

    pub fn in_flight(&self) -> usize {
        self.coordinator.in_flight()
    }

    pub fn describe_runner(&self) -> String {
        self.coordinator.describe_runner()
    }

    pub fn submit_job(&mut self, job: Job) -> JobSubmission {
        let job_name = job.name().to_string();
        let run_id = job.run_id().clone();
        match self.coordinator.submit_job(job) {
            Ok(_) => JobSubmission::Started,
            Err(e) => JobSubmission::Rejected(JobNotice {
                run_id,
                job_name,
                outcome: Outcome::LaunchFailed(format!("{e:#}")),
            }),
        }
    }

    /// Returns a notice when the event completed a run.
    pub fn handle(&mut self, event: ConsoleEvent) -> Option<JobNotice> {
        match event {
            ConsoleEvent::Finished { job, outcome } => self.coordinator.on_finished(job, outcome),
            ConsoleEvent::Request { request, reply } => {
                let response = self.respond(request);
                if reply.send(response).is_err() {
                    debug!("Client went away before the reply was sent");
                }
                None
            }
        }
    }

    fn respond(&mut self, request: CliToConsole) -> ConsoleToCli {
        match request {
            CliToConsole::Submit { job } => match self.coordinator.submit_job(job.into_job()) {
                Ok(run_id) => ConsoleToCli::Submitted {
                    run_id: run_id.to_string(),
                },
                Err(e) => ConsoleToCli::Error { e: format!("{e:#}") },
            },
            CliToConsole::Describe => ConsoleToCli::Runner {
                description: self.describe_runner(),
            },
        }
    }
}

pub enum JobSubmission {
    Started,
    Rejected(JobNotice),
}

fn build_runtime() -> Result<tokio::runtime::Runtime> {
    Ok(tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?)
}

/// Prints console lines from a blocking thread so a slow terminal never
/// stalls the inbox. Finishes once every sink handle is detached.
fn spawn_printer(mut lines: UnboundedReceiver<String>) -> JoinHandle<()> {
    tokio::task::spawn_blocking(move || {
        let stdout = std::io::stdout();
        let mut out = std::io::LineWriter::new(stdout.lock());
        while let Some(line) = lines.blocking_recv() {
            let _ = writeln!(out, "{line}");
        }
        let _ = out.flush();
    })
}

pub fn serve(paths: &AppPaths, config: &AppConfig) -> Result<()> {
    let runtime = build_runtime()?;

    let res = runtime.block_on(serve_until(paths, config, async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Interrupted, shutting down"),
            Err(e) => {
                warn!(error = %e, "Cannot listen for Ctrl-C, serving until killed");
                std::future::pending::<()>().await
            }
        }
    }));

    // don't wait on workers still blocked in a child process
    runtime.shutdown_background();
    res
}

/// The console loop behind `serve`: answers socket clients and applies
/// completions until `shutdown` resolves or the listener dies.
async fn serve_until(
    paths: &AppPaths,
    config: &AppConfig,
    shutdown: impl Future<Output = ()>,
) -> Result<()> {
    let (sink, lines) = LogSink::channel();
    let printer = spawn_printer(lines);
    let (mut console, mut inbox) = Console::new(paths, config, sink.clone())?;

    let name = socket_name(paths);
    let listener = listener::bind(&name)?;
    let mut listen_fut = tokio::spawn(listener::loop_listener(listener, console.inbox()));

    info!(socket = %name, runner = %console.describe_runner(), "Console running");
    sink.line(format!("Console running ({})", console.describe_runner()));

    tokio::pin!(shutdown);
    let res = loop {
        tokio::select! {
            Some(event) = inbox.recv() => {
                console.handle(event);
            }
            e = &mut listen_fut => {
                break Err(match e {
                    Ok(Ok(())) => anyhow!("Socket listener exited unexpectedly"),
                    Ok(Err(e)) => e.context("Socket listener failed"),
                    Err(e) => anyhow!("Socket listener panicked: {e}"),
                });
            }
            _ = &mut shutdown => break Ok(()),
        }
    };

    listen_fut.abort();
    listener::cleanup(&name);
    if console.in_flight() > 0 {
        warn!(
            in_flight = console.in_flight(),
            "Leaving jobs running; their history rows stay `running`"
        );
    }
    sink.detach();
    let _ = printer.await;
    res
}

/// Runs `jobs` on this process's own console, without a socket, and waits
/// for each of them. Notices come back in completion order.
pub fn run_jobs(paths: &AppPaths, config: &AppConfig, jobs: Vec<Job>) -> Result<Vec<JobNotice>> {
    let runtime = build_runtime()?;

    runtime.block_on(async move {
        let (sink, lines) = LogSink::channel();
        let printer = spawn_printer(lines);
        let (mut console, mut inbox) = Console::new(paths, config, sink.clone())?;

        let mut notices = Vec::with_capacity(jobs.len());
        for job in jobs {
            if let JobSubmission::Rejected(notice) = console.submit_job(job) {
                sink.line(notice.summary());
                notices.push(notice);
            }
        }

        while console.in_flight() > 0 {
            let Some(event) = inbox.recv().await else {
                break;
            };
            notices.extend(console.handle(event));
        }

        sink.detach();
        let _ = printer.await;
        Ok(notices)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RunnerConfig, RunnerMode};
    use crate::db::RunStatus;
    use crate::cli::ipc::send_command;
    use crate::ipc::JobRequest;
    use crate::job::RunId;
    use crate::utils::scratch_dir;
    use std::collections::BTreeMap;
    use std::path::PathBuf;
    use std::time::Duration;
    use tokio::sync::oneshot;

    fn paths(prefix: &str) -> AppPaths {
        let paths = AppPaths::from_root(scratch_dir(prefix));
        paths.ensure().unwrap();
        paths
    }

    #[test]
    fn run_jobs_waits_for_every_job() {
        let paths = paths("server_run_jobs");
        let cwd = paths.root.clone();
        let jobs = vec![
            Job::new("hello", ["echo", "hello"], &cwd),
            Job::new("nope", ["false"], &cwd),
            Job::new("missing", ["definitely-not-a-real-binary-xyz"], &cwd),
        ];
        let ids: Vec<_> = jobs.iter().map(|j| j.run_id().clone()).collect();

        let notices = run_jobs(&paths, &AppConfig::default(), jobs).unwrap();
        assert_eq!(notices.len(), 3);

        let by_name = |name: &str| notices.iter().find(|n| n.job_name == name).unwrap();
        assert!(by_name("hello").succeeded());
        assert_eq!(by_name("nope").outcome, Outcome::Exited(1));
        assert!(matches!(by_name("missing").outcome, Outcome::LaunchFailed(_)));

        let history = HistoryStore::open(paths.history_db()).unwrap();
        let hello = history.get(&ids[0]).unwrap().unwrap();
        assert_eq!(hello.status, RunStatus::Success);
        let out = std::fs::read_to_string(paths.run_dir(ids[0].as_str()).join("stdout.log")).unwrap();
        assert_eq!(out, "hello\n");
        assert_eq!(history.get(&ids[1]).unwrap().unwrap().status, RunStatus::Failed);
        assert_eq!(history.get(&ids[2]).unwrap().unwrap().status, RunStatus::Running);

        let _ = std::fs::remove_dir_all(&paths.root);
    }

    #[test]
    fn run_jobs_with_nothing_to_do() {
        let paths = paths("server_run_nothing");
        let notices = run_jobs(&paths, &AppConfig::default(), Vec::new()).unwrap();
        assert!(notices.is_empty());
        let _ = std::fs::remove_dir_all(&paths.root);
    }

    #[test]
    fn gitops_without_repo_fails_before_running_anything() {
        let paths = paths("server_gitops_misconfig");
        let config = AppConfig {
            runner: RunnerConfig {
                mode: RunnerMode::Gitops,
                gitops_repo_path: None,
            },
            ..Default::default()
        };
        let job = Job::new("x", ["true"], &paths.root);
        assert!(run_jobs(&paths, &config, vec![job]).is_err());
        let _ = std::fs::remove_dir_all(&paths.root);
    }

    #[test]
    fn served_console_runs_jobs_submitted_over_the_socket() {
        let paths = paths("server_serve");
        let name = socket_name(&paths);
        let client_paths = paths.clone();
        let (stop, stopped) = oneshot::channel::<()>();

        let runtime = build_runtime().unwrap();
        let (served, run_id) = runtime.block_on(async {
            let client = tokio::task::spawn_blocking(move || {
                let submit = || CliToConsole::Submit {
                    job: JobRequest {
                        name: "greet".to_string(),
                        argv: vec!["sh".into(), "-c".into(), "echo \"hi $WHO\"".into()],
                        cwd: client_paths.root.clone(),
                        env: BTreeMap::from([("WHO".to_string(), "there".to_string())]),
                    },
                };
                // the console may still be binding its socket
                let mut attempts = 0;
                let response = loop {
                    match send_command(&name, submit()) {
                        Ok(response) => break response,
                        Err(_) if attempts < 250 => {
                            attempts += 1;
                            std::thread::sleep(Duration::from_millis(20));
                        }
                        Err(e) => panic!("console never answered: {e:#}"),
                    }
                };
                let ConsoleToCli::Submitted { run_id } = response else {
                    panic!("expected submitted, got {response:?}");
                };
                let run_id: RunId = run_id.parse().unwrap();

                let history = HistoryStore::open(client_paths.history_db()).unwrap();
                for _ in 0..250 {
                    let status = history.get(&run_id).unwrap().map(|r| r.status);
                    if status == Some(RunStatus::Success) {
                        break;
                    }
                    std::thread::sleep(Duration::from_millis(20));
                }
                let _ = stop.send(());
                run_id
            });

            let config = AppConfig::default();
            let served = serve_until(&paths, &config, async {
                let _ = stopped.await;
            });
            let (served, client) = tokio::join!(served, client);
            (served, client.unwrap())
        });
        served.unwrap();

        let record = HistoryStore::open(paths.history_db())
            .unwrap()
            .get(&run_id)
            .unwrap()
            .unwrap();
        assert_eq!(record.status, RunStatus::Success);
        assert_eq!(record.job_name, "greet");
        assert_eq!(std::fs::read_to_string(&record.stdout_path).unwrap(), "hi there\n");

        let _ = std::fs::remove_dir_all(&paths.root);
    }

    #[tokio::test]
    async fn requests_are_answered_from_the_inbox() {
        let paths = paths("server_requests");
        let (sink, _lines) = LogSink::channel();
        let (mut console, mut inbox) = Console::new(&paths, &AppConfig::default(), sink).unwrap();
        let tx = console.inbox();

        let (reply, rx) = oneshot::channel();
        tx.send(ConsoleEvent::Request {
            request: CliToConsole::Describe,
            reply,
        })
        .unwrap_or_else(|_| panic!("inbox closed"));
        let event = inbox.recv().await.unwrap();
        assert!(console.handle(event).is_none());
        assert_eq!(
            rx.await.unwrap(),
            ConsoleToCli::Runner {
                description: "Direct execution on control plane".to_string()
            }
        );

        let (reply, rx) = oneshot::channel();
        tx.send(ConsoleEvent::Request {
            request: CliToConsole::Submit {
                job: JobRequest {
                    name: "remote".to_string(),
                    argv: vec!["true".to_string()],
                    cwd: PathBuf::from(&paths.root),
                    env: BTreeMap::new(),
                },
            },
            reply,
        })
        .unwrap_or_else(|_| panic!("inbox closed"));
        let event = inbox.recv().await.unwrap();
        console.handle(event);
        let ConsoleToCli::Submitted { run_id } = rx.await.unwrap() else {
            panic!("expected submitted");
        };
        assert_eq!(console.in_flight(), 1);

        let notice = console.handle(inbox.recv().await.unwrap()).unwrap();
        assert_eq!(notice.run_id.as_str(), run_id);
        assert!(notice.succeeded());
        assert_eq!(console.in_flight(), 0);

        let _ = std::fs::remove_dir_all(&paths.root);
    }
}
