use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing_futures::Instrument;

use crate::cloning::CloneRegistry;
use crate::metrics::{EventSink, ExecMetrics, NoEvents, NoopMetrics, RepoTracker};
use crate::protocol::Request;

pub const DEFAULT_QUEUE_CAPACITY: usize = 100;

#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Base directory for all managed repositories.
    pub repos_dir: PathBuf,
    /// Skip SSH host key verification. Susceptible to man-in-the-middle
    /// attacks; only for testing.
    pub insecure_skip_check_verify_ssh: bool,
    /// Requests that may wait for dispatch before enqueueing blocks.
    pub queue_capacity: usize,
    pub git_binary: PathBuf,
}

impl ServerConfig {
    pub fn new(repos_dir: impl Into<PathBuf>) -> Self {
        ServerConfig {
            repos_dir: repos_dir.into(),
            insecure_skip_check_verify_ssh: false,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            git_binary: PathBuf::from("git"),
        }
    }
}

pub struct Server {
    pub(crate) config: ServerConfig,
    pub(crate) cloning: CloneRegistry,
    pub(crate) metrics: Arc<dyn ExecMetrics>,
    pub(crate) events: Arc<dyn EventSink>,
    pub(crate) tracker: RepoTracker,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("config", &self.config)
            .field("cloning", &self.cloning)
            .finish()
    }
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        Server {
            config,
            cloning: CloneRegistry::new(),
            metrics: Arc::new(NoopMetrics),
            events: Arc::new(NoEvents),
            tracker: RepoTracker::default(),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn ExecMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn with_tracker(mut self, tracker: RepoTracker) -> Self {
        self.tracker = tracker;
        self
    }

    pub fn with_clone_registry(mut self, cloning: CloneRegistry) -> Self {
        self.cloning = cloning;
        self
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Handle for the clone workflow to mark repositories as being cloned.
    pub fn cloning(&self) -> &CloneRegistry {
        &self.cloning
    }

    /// Directory of `repo` under the repos dir, or `None` if `repo` does not
    /// name a directory strictly inside it.
    pub fn repo_dir(&self, repo: &str) -> Option<PathBuf> {
        resolve_repo_dir(&self.config.repos_dir, repo)
    }

    /// Start the dispatcher. Requests pushed into the returned sender are
    /// executed until every clone of it is dropped.
    pub fn serve(self: Arc<Self>) -> (mpsc::Sender<Request>, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(self.config.queue_capacity.max(1));
        let dispatcher = tokio::spawn(
            self.process_requests(rx)
                .instrument(tracing::info_span!("dispatcher")),
        );

        (tx, dispatcher)
    }

    pub async fn process_requests(self: Arc<Self>, mut requests: mpsc::Receiver<Request>) {
        tracing::debug!(repos_dir = %self.config.repos_dir.display(), "accepting requests");

        while let Some(request) = requests.recv().await {
            match request {
                Request::Exec(req) => {
                    let server = self.clone();
                    tokio::spawn(server.supervise_exec(req).in_current_span());
                }
            }
        }

        tracing::debug!("request queue closed");
    }
}

pub(crate) fn resolve_repo_dir(repos_dir: &Path, repo: &str) -> Option<PathBuf> {
    let mut dir = repos_dir.to_path_buf();
    let mut depth = 0;

    for component in Path::new(repo.trim_start_matches('/')).components() {
        match component {
            Component::Normal(part) => {
                dir.push(part);
                depth += 1;
            }
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }

    (depth > 0).then_some(dir)
}
