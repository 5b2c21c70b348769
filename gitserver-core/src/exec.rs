use std::future::Future;
use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use tokio::process::Command;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing_futures::Instrument;

use crate::metrics::{ExecEvent, ExecMetrics};
use crate::protocol::{ExecReply, ExecRequest, ExecStreams, ProcessResult, EXIT_STATUS_NOT_SET};
use crate::remote::{self, RemoteOptions};
use crate::server::Server;
use crate::stream::{self, ChunkReceiver, ChunkSender};

const FAULT_ERROR: &str = "internal error";

/// Reply and result sinks of one request, shared between the handler and its
/// supervisor so that the supervisor can close whatever the handler left open.
pub(crate) struct ExecSinks {
    state: Mutex<SinkState>,
}

struct SinkState {
    reply: Option<oneshot::Sender<ExecReply>>,
    result: Option<oneshot::Sender<ProcessResult>>,
}

impl ExecSinks {
    pub(crate) fn new(reply: oneshot::Sender<ExecReply>) -> Arc<Self> {
        Arc::new(ExecSinks {
            state: Mutex::new(SinkState {
                reply: Some(reply),
                result: None,
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, SinkState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn reply(&self, reply: ExecReply) {
        if let Some(tx) = self.lock().reply.take() {
            if tx.send(reply).is_err() {
                tracing::debug!("caller went away before the reply");
            }
        }
    }

    /// Send the streaming reply and keep the result sink for [`Self::finish`].
    /// Returns the producing ends of stdout and stderr.
    pub(crate) fn start_streams(&self) -> (ChunkSender, ChunkSender) {
        let (stdout_tx, stdout) = stream::chunk_channel();
        let (stderr_tx, stderr) = stream::chunk_channel();
        let (result_tx, process_result) = oneshot::channel();

        let mut state = self.lock();
        state.result = Some(result_tx);
        if let Some(tx) = state.reply.take() {
            let streams = ExecStreams {
                stdout,
                stderr,
                process_result,
            };
            if tx.send(ExecReply::Running(streams)).is_err() {
                tracing::debug!("caller went away before the reply");
            }
        }

        (stdout_tx, stderr_tx)
    }

    pub(crate) fn finish(&self, result: ProcessResult) {
        if let Some(tx) = self.lock().result.take() {
            let _ = tx.send(result);
        }
    }

    /// Close both sinks, delivering `error` to whichever was still open.
    /// Returns whether anything was left open.
    pub(crate) fn close_with_fault(&self, error: &str) -> bool {
        let mut state = self.lock();
        let mut left_open = false;

        if let Some(tx) = state.reply.take() {
            left_open = true;

            // Streams whose producers are already gone read as empty.
            let (_, stdout) = stream::chunk_channel();
            let (_, stderr) = stream::chunk_channel();
            let (result_tx, process_result) = oneshot::channel();
            let _ = result_tx.send(ProcessResult::not_started(error.to_owned()));
            let _ = tx.send(ExecReply::Running(ExecStreams {
                stdout,
                stderr,
                process_result,
            }));
        }

        if let Some(tx) = state.result.take() {
            left_open = true;
            let _ = tx.send(ProcessResult::not_started(error.to_owned()));
        }

        left_open
    }
}

pub(crate) enum ExecOutcome {
    CloneInProgress,
    RepoNotFound,
    Completed {
        result: ProcessResult,
        stdout_size: u64,
        stderr_size: u64,
    },
    Fault,
}

impl ExecOutcome {
    pub(crate) fn status(&self) -> String {
        match self {
            ExecOutcome::CloneInProgress => "clone-in-progress".to_owned(),
            ExecOutcome::RepoNotFound => "repo-not-found".to_owned(),
            ExecOutcome::Completed { result, .. } => result.exit_status.to_string(),
            ExecOutcome::Fault => "internal-error".to_owned(),
        }
    }
}

struct RunningGuard<'a> {
    metrics: &'a dyn ExecMetrics,
    cmd: &'a str,
    repo: &'a str,
}

impl<'a> RunningGuard<'a> {
    fn new(metrics: &'a dyn ExecMetrics, cmd: &'a str, repo: &'a str) -> Self {
        metrics.running_inc(cmd, repo);
        RunningGuard { metrics, cmd, repo }
    }
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.metrics.running_dec(self.cmd, self.repo);
    }
}

async fn repo_exists(dir: &Path) -> bool {
    for marker in [dir.join("HEAD"), dir.join(".git").join("HEAD")] {
        if tokio::fs::metadata(&marker).await.is_ok() {
            return true;
        }
    }
    false
}

impl Server {
    /// Run one exec request to completion and record it. Whatever happens to
    /// the handler, the caller gets exactly one reply and, on the streaming
    /// branch, exactly one result.
    pub(crate) async fn supervise_exec(self: Arc<Self>, req: ExecRequest) {
        self.supervise_with(req, Server::handle_exec).await
    }

    async fn supervise_with<H, F>(self: Arc<Self>, req: ExecRequest, handler: H)
    where
        H: FnOnce(Arc<Self>, String, Vec<String>, RemoteOptions, ChunkReceiver, Arc<ExecSinks>) -> F,
        F: Future<Output = ExecOutcome> + Send + 'static,
    {
        let start = Instant::now();
        let ExecRequest {
            repo,
            args,
            opt,
            stdin,
            reply,
        } = req;

        let cmd = args.first().cloned().unwrap_or_default();
        let tracked = self.tracker.label(&repo);
        let running = RunningGuard::new(self.metrics.as_ref(), &cmd, &tracked);

        let sinks = ExecSinks::new(reply);
        let handler = tokio::spawn(
            handler(
                self.clone(),
                repo.clone(),
                args.clone(),
                opt,
                stdin,
                sinks.clone(),
            )
            .in_current_span(),
        );

        let outcome = match handler.await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(repo = %repo, error = %e, "exec handler failed");
                ExecOutcome::Fault
            }
        };

        if sinks.close_with_fault(FAULT_ERROR) {
            tracing::error!(repo = %repo, "exec handler left its reply open");
        }

        let duration = start.elapsed();
        self.metrics
            .observe_duration(&cmd, &tracked, &outcome.status(), duration);
        drop(running);

        if let ExecOutcome::Completed {
            result,
            stdout_size,
            stderr_size,
        } = &outcome
        {
            if result.ran() && self.events.enabled() {
                let event = ExecEvent {
                    repo,
                    cmd,
                    args: args.join(" "),
                    duration_ms: duration.as_secs_f64() * 1000.0,
                    stdout_size: *stdout_size,
                    stderr_size: *stderr_size,
                    exit_status: result.exit_status,
                    error: Some(result.error.clone()).filter(|e| !e.is_empty()),
                };
                if let Err(e) = self.events.send(&event) {
                    tracing::warn!(error = %e, "failed to send exec event");
                }
            }
        }
    }

    #[tracing::instrument(skip(self, opt, stdin, sinks))]
    pub(crate) async fn handle_exec(
        self: Arc<Self>,
        repo: String,
        args: Vec<String>,
        opt: RemoteOptions,
        mut stdin: ChunkReceiver,
        sinks: Arc<ExecSinks>,
    ) -> ExecOutcome {
        let dir = self.repo_dir(&repo);

        if let Some(dir) = &dir {
            if self.cloning.contains(dir) {
                stream::drain(&mut stdin).await;
                sinks.reply(ExecReply::CloneInProgress);
                tracing::debug!("clone in progress");
                return ExecOutcome::CloneInProgress;
            }
        }

        let exists = match &dir {
            Some(dir) => repo_exists(dir).await,
            None => false,
        };

        let dir = match dir {
            Some(dir) if exists => dir,
            _ => {
                stream::drain(&mut stdin).await;
                sinks.reply(ExecReply::RepoNotFound);
                tracing::debug!("repo not found");
                return ExecOutcome::RepoNotFound;
            }
        };

        let (stdout_tx, stderr_tx) = sinks.start_streams();
        let (result, stdout_size, stderr_size) = self
            .run_git(&dir, &args, &opt, &mut stdin, stdout_tx, stderr_tx)
            .await;

        stream::drain(&mut stdin).await;

        tracing::debug!(
            exit_status = result.exit_status,
            error = %result.error,
            stdout_size,
            stderr_size,
            "git finished"
        );

        sinks.finish(result.clone());
        ExecOutcome::Completed {
            result,
            stdout_size,
            stderr_size,
        }
    }

    /// Run git in `dir`, wiring its stdio to the chunk streams. Both output
    /// senders are dropped, and so closed, by the time this returns.
    async fn run_git(
        &self,
        dir: &Path,
        args: &[String],
        opt: &RemoteOptions,
        stdin: &mut ChunkReceiver,
        stdout_tx: ChunkSender,
        stderr_tx: ChunkSender,
    ) -> (ProcessResult, u64, u64) {
        let mut cmd = Command::new(&self.config.git_binary);
        cmd.args(args)
            .current_dir(dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let _remote_env =
            match remote::apply(&mut cmd, opt, self.config.insecure_skip_check_verify_ssh) {
                Ok(remote_env) => remote_env,
                Err(e) => return (ProcessResult::not_started(e.0), 0, 0),
            };

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                tracing::warn!(error = %e, "could not start git");
                return (ProcessResult::not_started(e.to_string()), 0, 0);
            }
        };

        let (child_stdin, child_stdout, child_stderr) =
            match (child.stdin.take(), child.stdout.take(), child.stderr.take()) {
                (Some(i), Some(o), Some(e)) => (i, o, e),
                _ => {
                    let _ = child.kill().await;
                    let error = "git stdio was not captured".to_owned();
                    return (ProcessResult::not_started(error), 0, 0);
                }
            };

        // Once git has exited nobody reads its stdin anymore; stop feeding it.
        let stdin_cancel = CancellationToken::new();
        let stdin_cancel_wait = stdin_cancel.clone();

        let feed = async {
            tokio::select! {
                fed = stream::feed_input(stdin, child_stdin) => fed,
                _ = stdin_cancel.cancelled() => Ok(()),
            }
        };

        let wait = async {
            let _cancel_stdin = stdin_cancel_wait.drop_guard();
            child.wait().await
        };

        let (fed, stdout_size, stderr_size, status) = tokio::join!(
            feed,
            stream::pump_output(child_stdout, stdout_tx),
            stream::pump_output(child_stderr, stderr_tx),
            wait,
        );

        let mut errors = vec![];

        let exit_status = match status {
            Ok(status) => match status.code() {
                Some(code) => code,
                None => {
                    errors.push(format!(
                        "git terminated by signal {}",
                        status.signal().unwrap_or_default()
                    ));
                    -1
                }
            },
            Err(e) => {
                errors.push(format!("waiting for git: {}", e));
                EXIT_STATUS_NOT_SET
            }
        };

        if let Err(e) = fed {
            errors.push(format!("writing stdin: {}", e));
        }

        let stdout_size = stdout_size.unwrap_or_else(|e| {
            errors.push(format!("reading stdout: {}", e));
            0
        });
        let stderr_size = stderr_size.unwrap_or_else(|e| {
            errors.push(format!("reading stderr: {}", e));
            0
        });

        let result = ProcessResult {
            error: errors.join("; "),
            exit_status,
        };

        (result, stdout_size, stderr_size)
    }
}
