use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::remote::RemoteOptions;
use crate::stream::{self, ChunkReceiver, ChunkSender};

/// Exit status reported when the git process never started.
pub const EXIT_STATUS_NOT_SET: i32 = -10810;

#[derive(Debug)]
#[non_exhaustive]
pub enum Request {
    Exec(ExecRequest),
}

/// A request to execute a command inside a git repository.
#[derive(Debug)]
pub struct ExecRequest {
    pub repo: String,
    pub args: Vec<String>,
    pub opt: RemoteOptions,
    pub stdin: ChunkReceiver,
    pub reply: oneshot::Sender<ExecReply>,
}

/// The caller's half of an [`ExecRequest`].
#[derive(Debug)]
pub struct ExecHandle {
    pub stdin: ChunkSender,
    pub reply: oneshot::Receiver<ExecReply>,
}

impl ExecRequest {
    pub fn new<S: AsRef<str>>(
        repo: &str,
        args: &[S],
        opt: RemoteOptions,
    ) -> (ExecRequest, ExecHandle) {
        let (stdin_tx, stdin_rx) = stream::chunk_channel();
        let (reply_tx, reply_rx) = oneshot::channel();

        let request = ExecRequest {
            repo: repo.to_owned(),
            args: args.iter().map(|a| a.as_ref().to_owned()).collect(),
            opt,
            stdin: stdin_rx,
            reply: reply_tx,
        };
        let handle = ExecHandle {
            stdin: stdin_tx,
            reply: reply_rx,
        };

        (request, handle)
    }
}

#[derive(Debug)]
pub enum ExecReply {
    /// Nothing was run because the repository does not exist.
    RepoNotFound,
    /// Nothing was run because the repository is being cloned.
    CloneInProgress,
    /// git was started (or at least attempted); output follows.
    Running(ExecStreams),
}

#[derive(Debug)]
pub struct ExecStreams {
    pub stdout: ChunkReceiver,
    pub stderr: ChunkReceiver,
    pub process_result: oneshot::Receiver<ProcessResult>,
}

impl ExecReply {
    pub fn repo_not_found(&self) -> bool {
        matches!(self, ExecReply::RepoNotFound)
    }

    pub fn clone_in_progress(&self) -> bool {
        matches!(self, ExecReply::CloneInProgress)
    }

    pub fn flags(&self) -> ReplyFlags {
        ReplyFlags {
            repo_not_found: self.repo_not_found(),
            clone_in_progress: self.clone_in_progress(),
        }
    }

    pub fn into_streams(self) -> Option<ExecStreams> {
        match self {
            ExecReply::Running(streams) => Some(streams),
            _ => None,
        }
    }
}

/// Wire form of the reply status.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReplyFlags {
    pub repo_not_found: bool,
    pub clone_in_progress: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ProcessResult {
    #[serde(default)]
    pub error: String,
    pub exit_status: i32,
}

impl ProcessResult {
    pub fn not_started(error: String) -> ProcessResult {
        ProcessResult {
            error,
            exit_status: EXIT_STATUS_NOT_SET,
        }
    }

    pub fn ran(&self) -> bool {
        self.exit_status != EXIT_STATUS_NOT_SET
    }
}
