use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use gitserver_core::protocol::{ExecHandle, ExecReply, ExecRequest, ProcessResult, Request};
use gitserver_core::remote::RemoteOptions;
use gitserver_core::stream::ChunkReceiver;
use gitserver_core::{Server, ServerConfig};
use tokio::sync::mpsc;

pub const TIMEOUT: Duration = Duration::from_secs(30);

/// Create a non-bare repository at `path` with a single commit and return
/// the commit id.
pub fn init_repo(path: &Path) -> anyhow::Result<git2::Oid> {
    let repo = git2::Repository::init(path)?;
    std::fs::write(path.join("README"), "hello\n")?;

    let mut index = repo.index()?;
    index.add_path(Path::new("README"))?;
    index.write()?;
    let tree = repo.find_tree(index.write_tree()?)?;

    let sig = git2::Signature::now("gitserver", "gitserver@example.com")?;
    Ok(repo.commit(Some("HEAD"), &sig, &sig, "initial", &tree, &[])?)
}

pub fn start(server: Server) -> (Arc<Server>, mpsc::Sender<Request>) {
    let server = Arc::new(server);
    let (requests, _dispatcher) = server.clone().serve();
    (server, requests)
}

pub fn config(repos_dir: &Path) -> ServerConfig {
    ServerConfig::new(repos_dir)
}

pub async fn submit(
    requests: &mpsc::Sender<Request>,
    repo: &str,
    args: &[&str],
) -> anyhow::Result<ExecHandle> {
    let (request, handle) = ExecRequest::new(repo, args, RemoteOptions::default());
    requests.send(Request::Exec(request)).await?;
    Ok(handle)
}

/// Read a whole stream into memory.
pub async fn collect(mut rx: ChunkReceiver) -> Vec<u8> {
    let mut out = Vec::new();
    while let Some(chunk) = rx.recv().await {
        out.extend_from_slice(&chunk);
    }
    out
}

pub struct Output {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub result: ProcessResult,
}

pub async fn finish(reply: ExecReply) -> anyhow::Result<Output> {
    let streams = reply
        .into_streams()
        .ok_or_else(|| anyhow::anyhow!("expected a streaming reply"))?;

    let (stdout, stderr) = tokio::join!(
        collect(streams.stdout),
        collect(streams.stderr)
    );
    let result = streams.process_result.await?;

    Ok(Output {
        stdout,
        stderr,
        result,
    })
}

/// Run `args` in `repo` with `input` as stdin and wait for everything.
pub async fn run(
    requests: &mpsc::Sender<Request>,
    repo: &str,
    args: &[&str],
    input: &[u8],
) -> anyhow::Result<Output> {
    let handle = submit(requests, repo, args).await?;
    if !input.is_empty() {
        handle.stdin.send(input.to_vec()).await?;
    }
    drop(handle.stdin);

    let reply = tokio::time::timeout(TIMEOUT, handle.reply).await??;
    tokio::time::timeout(TIMEOUT, finish(reply)).await?
}
