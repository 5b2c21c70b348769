//! Instrumentation ports for exec requests and their Prometheus backing.

use std::time::Duration;

use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::Histogram;
use prometheus_client::registry::Registry;
use regex::Regex;

use crate::GitserverResult;

/// Latency buckets in seconds, tuned for requests a user waits on.
pub const USER_LATENCY_BUCKETS: [f64; 7] = [0.2, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0];

/// Sink for per-request gauges and histograms.
///
/// Implementations must not panic or block; a metrics backend problem is
/// never allowed to change the outcome of a request.
pub trait ExecMetrics: Send + Sync {
    fn running_inc(&self, cmd: &str, repo: &str);
    fn running_dec(&self, cmd: &str, repo: &str);
    fn observe_duration(&self, cmd: &str, repo: &str, status: &str, duration: Duration);
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RunningLabels {
    pub cmd: String,
    pub repo: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct DurationLabels {
    pub cmd: String,
    pub repo: String,
    pub status: String,
}

pub struct PrometheusMetrics {
    pub exec_running: Family<RunningLabels, Gauge>,
    pub exec_duration_seconds: Family<DurationLabels, Histogram>,
}

impl PrometheusMetrics {
    /// Create the exec metrics and register them with `registry`.
    pub fn new(registry: &mut Registry) -> Self {
        let exec_running = Family::<RunningLabels, Gauge>::default();
        registry.register(
            "src_gitserver_exec_running",
            "number of gitserver commands running concurrently",
            exec_running.clone(),
        );

        let exec_duration_seconds: Family<DurationLabels, Histogram> =
            Family::new_with_constructor(|| Histogram::new(USER_LATENCY_BUCKETS.into_iter()));
        registry.register(
            "src_gitserver_exec_duration_seconds",
            "gitserver command latencies in seconds",
            exec_duration_seconds.clone(),
        );

        Self {
            exec_running,
            exec_duration_seconds,
        }
    }
}

impl ExecMetrics for PrometheusMetrics {
    fn running_inc(&self, cmd: &str, repo: &str) {
        self.exec_running
            .get_or_create(&RunningLabels {
                cmd: cmd.to_owned(),
                repo: repo.to_owned(),
            })
            .inc();
    }

    fn running_dec(&self, cmd: &str, repo: &str) {
        self.exec_running
            .get_or_create(&RunningLabels {
                cmd: cmd.to_owned(),
                repo: repo.to_owned(),
            })
            .dec();
    }

    fn observe_duration(&self, cmd: &str, repo: &str, status: &str, duration: Duration) {
        self.exec_duration_seconds
            .get_or_create(&DurationLabels {
                cmd: cmd.to_owned(),
                repo: repo.to_owned(),
                status: status.to_owned(),
            })
            .observe(duration.as_secs_f64());
    }
}

pub struct NoopMetrics;

impl ExecMetrics for NoopMetrics {
    fn running_inc(&self, _cmd: &str, _repo: &str) {}
    fn running_dec(&self, _cmd: &str, _repo: &str) {}
    fn observe_duration(&self, _cmd: &str, _repo: &str, _status: &str, _duration: Duration) {}
}

/// One record per git execution, sent to an [`EventSink`].
#[derive(serde::Serialize, Debug, Clone, PartialEq)]
pub struct ExecEvent {
    pub repo: String,
    pub cmd: String,
    pub args: String,
    pub duration_ms: f64,
    pub stdout_size: u64,
    pub stderr_size: u64,
    pub exit_status: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ExecEvent {
    pub const NAME: &'static str = "gitserver-exec";
}

pub trait EventSink: Send + Sync {
    fn enabled(&self) -> bool;
    fn send(&self, event: &ExecEvent) -> GitserverResult<()>;
}

/// Disabled sink; events are dropped before they are built.
pub struct NoEvents;

impl EventSink for NoEvents {
    fn enabled(&self) -> bool {
        false
    }

    fn send(&self, _event: &ExecEvent) -> GitserverResult<()> {
        Ok(())
    }
}

/// Emits each event as a structured `tracing` event on the
/// `gitserver_core::events` target, so any subscriber layer can ship it.
pub struct TracingEvents;

impl EventSink for TracingEvents {
    fn enabled(&self) -> bool {
        true
    }

    fn send(&self, event: &ExecEvent) -> GitserverResult<()> {
        tracing::info!(
            target: "gitserver_core::events",
            event = ExecEvent::NAME,
            repo = %event.repo,
            cmd = %event.cmd,
            args = %event.args,
            duration_ms = event.duration_ms,
            stdout_size = event.stdout_size,
            stderr_size = event.stderr_size,
            exit_status = event.exit_status,
            error = event.error.as_deref(),
        );
        Ok(())
    }
}

/// Maps repository names onto a small set of metric label values.
///
/// Repositories matching one of the configured patterns keep their name,
/// everything else is reported as [`RepoTracker::UNKNOWN`].
#[derive(Clone, Debug, Default)]
pub struct RepoTracker {
    tracked: Vec<Regex>,
}

impl RepoTracker {
    pub const UNKNOWN: &'static str = "unknown";

    pub fn new(patterns: &[String]) -> GitserverResult<Self> {
        let tracked = patterns
            .iter()
            .map(|p| Regex::new(&format!("^(?:{})$", p)))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self { tracked })
    }

    pub fn label(&self, repo: &str) -> String {
        let repo = repo.trim_matches('/');
        if self.tracked.iter().any(|r| r.is_match(repo)) {
            repo.to_owned()
        } else {
            Self::UNKNOWN.to_owned()
        }
    }
}
