mod helpers;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use gitserver_core::metrics::{EventSink, ExecEvent, ExecMetrics, RepoTracker};
use gitserver_core::protocol::{ExecReply, ExecRequest, Request, EXIT_STATUS_NOT_SET};
use gitserver_core::remote::RemoteOptions;
use gitserver_core::stream::{self, CHUNK_SIZE};
use gitserver_core::{gitserver_error, GitserverResult, Server};
use helpers::*;
use tempdir::TempDir;
use tokio::sync::oneshot::error::TryRecvError;

#[tokio::test]
async fn missing_repo_drains_stdin() -> anyhow::Result<()> {
    let td = TempDir::new("gitserver")?;
    let (_server, requests) = start(Server::new(config(td.path())));

    let handle = submit(&requests, "github.com/foo/missing", &["log"]).await?;

    // More than the stream can buffer: only completes if the handler drains.
    let stdin = handle.stdin;
    let writer = tokio::spawn(async move {
        for _ in 0..(stream::STREAM_DEPTH * 8) {
            stdin.send(vec![0u8; 1024]).await?;
        }
        anyhow::Ok(())
    });

    let reply = tokio::time::timeout(TIMEOUT, handle.reply).await??;
    assert!(reply.repo_not_found());
    assert!(!reply.clone_in_progress());
    assert!(reply.into_streams().is_none());

    tokio::time::timeout(TIMEOUT, writer).await???;
    Ok(())
}

#[tokio::test]
async fn escaping_repo_path_is_not_found() -> anyhow::Result<()> {
    let td = TempDir::new("gitserver")?;
    let repos = td.path().join("repos");
    init_repo(&td.path().join("outside"))?;
    std::fs::create_dir_all(&repos)?;

    let (_server, requests) = start(Server::new(config(&repos)));

    for repo in ["../outside", "", "a/../../outside"] {
        let handle = submit(&requests, repo, &["rev-parse", "HEAD"]).await?;
        drop(handle.stdin);
        let reply = tokio::time::timeout(TIMEOUT, handle.reply).await??;
        assert!(reply.repo_not_found(), "{:?} should not resolve", repo);
    }

    Ok(())
}

#[tokio::test]
async fn clone_in_progress_gates_until_removed() -> anyhow::Result<()> {
    let td = TempDir::new("gitserver")?;
    let head = init_repo(&td.path().join("github.com/foo/bar"))?;
    let (server, requests) = start(Server::new(config(td.path())));

    let dir = server.repo_dir("github.com/foo/bar").unwrap();
    let guard = server.cloning().start(&dir).unwrap();

    let handle = submit(&requests, "github.com/foo/bar", &["rev-parse", "HEAD"]).await?;
    handle.stdin.send(b"ignored".to_vec()).await?;
    drop(handle.stdin);
    let reply = tokio::time::timeout(TIMEOUT, handle.reply).await??;
    assert!(reply.clone_in_progress());
    assert!(!reply.repo_not_found());
    assert!(reply.into_streams().is_none());

    drop(guard);

    let output = run(&requests, "github.com/foo/bar", &["rev-parse", "HEAD"], b"").await?;
    assert_eq!(output.result.exit_status, 0);
    assert_eq!(output.stdout, format!("{}\n", head).into_bytes());
    Ok(())
}

#[tokio::test]
async fn stdout_is_exactly_what_git_wrote() -> anyhow::Result<()> {
    let td = TempDir::new("gitserver")?;
    let head = init_repo(&td.path().join("repo"))?;
    let (_server, requests) = start(Server::new(config(td.path())));

    let output = run(
        &requests,
        "repo",
        &["for-each-ref", "--format=%(objectname) %(refname)"],
        b"",
    )
    .await?;

    let branch = git2::Repository::open(td.path().join("repo"))?
        .head()?
        .name()
        .map(str::to_owned)
        .unwrap();

    assert_eq!(output.result.exit_status, 0);
    assert_eq!(output.result.error, "");
    assert!(output.stderr.is_empty());
    assert_eq!(
        String::from_utf8(output.stdout)?,
        format!("{} {}\n", head, branch)
    );
    Ok(())
}

#[tokio::test]
async fn bare_repositories_are_found() -> anyhow::Result<()> {
    let td = TempDir::new("gitserver")?;
    git2::Repository::init_bare(td.path().join("bare.git"))?;
    let (_server, requests) = start(Server::new(config(td.path())));

    let output = run(&requests, "bare.git", &["rev-parse", "--is-bare-repository"], b"").await?;
    assert_eq!(output.result.exit_status, 0);
    assert_eq!(output.stdout, b"true\n");
    Ok(())
}

#[tokio::test]
async fn stdin_reaches_git() -> anyhow::Result<()> {
    let td = TempDir::new("gitserver")?;
    init_repo(&td.path().join("repo"))?;
    let (_server, requests) = start(Server::new(config(td.path())));

    let input = b"some content that git hashes\n".repeat(5000);
    let expected = git2::Oid::hash_object(git2::ObjectType::Blob, &input)?;

    let output = run(&requests, "repo", &["hash-object", "--stdin"], &input).await?;
    assert_eq!(output.result.exit_status, 0);
    assert_eq!(output.stdout, format!("{}\n", expected).into_bytes());
    Ok(())
}

#[tokio::test]
async fn non_zero_exit_is_not_an_error() -> anyhow::Result<()> {
    let td = TempDir::new("gitserver")?;
    init_repo(&td.path().join("repo"))?;
    let (_server, requests) = start(Server::new(config(td.path())));

    let output = run(&requests, "repo", &["rev-parse", "--verify", "no-such-ref"], b"").await?;
    assert_eq!(output.result.exit_status, 128);
    assert_eq!(output.result.error, "");
    assert!(output.result.ran());
    assert!(!output.stderr.is_empty());
    Ok(())
}

#[tokio::test]
async fn missing_executable_reports_sentinel() -> anyhow::Result<()> {
    let td = TempDir::new("gitserver")?;
    init_repo(&td.path().join("repo"))?;

    let mut config = config(td.path());
    config.git_binary = td.path().join("no-such-git");
    let (_server, requests) = start(Server::new(config));

    let output = run(&requests, "repo", &["status"], b"input").await?;
    assert_eq!(output.result.exit_status, EXIT_STATUS_NOT_SET);
    assert!(!output.result.error.is_empty());
    assert!(output.stdout.is_empty());
    assert!(output.stderr.is_empty());
    Ok(())
}

#[tokio::test]
async fn large_output_streams_before_exit() -> anyhow::Result<()> {
    let td = TempDir::new("gitserver")?;
    let path = td.path().join("repo");
    init_repo(&path)?;

    let data: Vec<u8> = (0..4 * 1024 * 1024).map(|i: u32| (i % 253) as u8).collect();
    let blob = git2::Repository::open(&path)?.blob(&data)?;

    let (_server, requests) = start(Server::new(config(td.path())));
    let handle = submit(&requests, "repo", &["cat-file", "blob", &blob.to_string()]).await?;
    drop(handle.stdin);

    let reply = tokio::time::timeout(TIMEOUT, handle.reply).await??;
    let mut streams = reply.into_streams().unwrap();

    let first = tokio::time::timeout(TIMEOUT, streams.stdout.recv())
        .await?
        .unwrap();
    assert!(first.len() <= CHUNK_SIZE);

    // git cannot have finished: the rest of its output has nowhere to go yet.
    assert_eq!(streams.process_result.try_recv(), Err(TryRecvError::Empty));

    let mut stdout = first;
    stdout.extend(collect(streams.stdout).await);
    let result = tokio::time::timeout(TIMEOUT, streams.process_result).await??;

    assert_eq!(result.exit_status, 0);
    assert_eq!(stdout.len(), data.len());
    assert!(stdout == data);
    Ok(())
}

#[tokio::test]
async fn distinct_repos_run_concurrently() -> anyhow::Result<()> {
    let td = TempDir::new("gitserver")?;
    init_repo(&td.path().join("slow"))?;
    let fast_head = init_repo(&td.path().join("fast"))?;
    let (_server, requests) = start(Server::new(config(td.path())));

    // Blocks until its stdin is closed.
    let slow = submit(&requests, "slow", &["hash-object", "--stdin"]).await?;
    slow.stdin.send(b"partial".to_vec()).await?;
    let slow_reply = tokio::time::timeout(TIMEOUT, slow.reply).await??;

    let fast = run(&requests, "fast", &["rev-parse", "HEAD"], b"").await?;
    assert_eq!(fast.stdout, format!("{}\n", fast_head).into_bytes());

    let mut slow_streams = slow_reply.into_streams().unwrap();
    assert_eq!(slow_streams.process_result.try_recv(), Err(TryRecvError::Empty));

    drop(slow.stdin);
    let slow = tokio::time::timeout(TIMEOUT, finish(ExecReply::Running(slow_streams))).await??;
    let expected = git2::Oid::hash_object(git2::ObjectType::Blob, b"partial")?;
    assert_eq!(slow.stdout, format!("{}\n", expected).into_bytes());
    Ok(())
}

#[tokio::test]
async fn dispatcher_stops_when_queue_closes() -> anyhow::Result<()> {
    let td = TempDir::new("gitserver")?;
    let server = Arc::new(Server::new(config(td.path())));
    let (requests, dispatcher) = server.serve();

    let (request, handle) = ExecRequest::new("missing", &["log"], RemoteOptions::default());
    requests.send(Request::Exec(request)).await?;
    drop(handle.stdin);
    drop(requests);

    tokio::time::timeout(TIMEOUT, dispatcher).await??;
    let reply = tokio::time::timeout(TIMEOUT, handle.reply).await??;
    assert!(reply.repo_not_found());
    Ok(())
}

#[derive(Default)]
struct RecordingMetrics {
    running: Mutex<HashMap<(String, String), i64>>,
    observed: Mutex<Vec<(String, String, String)>>,
}

impl ExecMetrics for RecordingMetrics {
    fn running_inc(&self, cmd: &str, repo: &str) {
        *self
            .running
            .lock()
            .unwrap()
            .entry((cmd.to_owned(), repo.to_owned()))
            .or_default() += 1;
    }

    fn running_dec(&self, cmd: &str, repo: &str) {
        *self
            .running
            .lock()
            .unwrap()
            .entry((cmd.to_owned(), repo.to_owned()))
            .or_default() -= 1;
    }

    fn observe_duration(&self, cmd: &str, repo: &str, status: &str, _duration: Duration) {
        self.observed
            .lock()
            .unwrap()
            .push((cmd.to_owned(), repo.to_owned(), status.to_owned()));
    }
}

/// Records every event, then fails as a broken backend would.
#[derive(Default)]
struct FailingEvents {
    sent: Mutex<Vec<ExecEvent>>,
}

impl EventSink for FailingEvents {
    fn enabled(&self) -> bool {
        true
    }

    fn send(&self, event: &ExecEvent) -> GitserverResult<()> {
        self.sent.lock().unwrap().push(event.clone());
        Err(gitserver_error("event backend unavailable"))
    }
}

async fn wait_for(what: impl Fn() -> bool) {
    tokio::time::timeout(TIMEOUT, async {
        while !what() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time")
}

#[tokio::test]
async fn instrumentation_records_every_outcome() -> anyhow::Result<()> {
    let td = TempDir::new("gitserver")?;
    init_repo(&td.path().join("github.com/foo/bar"))?;

    let metrics = Arc::new(RecordingMetrics::default());
    let events = Arc::new(FailingEvents::default());
    let server = Server::new(config(td.path()))
        .with_metrics(metrics.clone())
        .with_events(events.clone())
        .with_tracker(
            RepoTracker::new(&["github.com/foo/.*".to_owned()]).map_err(|e| anyhow::anyhow!(e.0))?,
        );
    let (server, requests) = start(server);

    let missing = submit(&requests, "github.com/other/missing", &["log"]).await?;
    drop(missing.stdin);
    assert!(missing.reply.await?.repo_not_found());

    let dir = server.repo_dir("github.com/foo/bar").unwrap();
    {
        let _guard = server.cloning().start(&dir).unwrap();
        let cloning = submit(&requests, "github.com/foo/bar", &["fetch"]).await?;
        drop(cloning.stdin);
        assert!(cloning.reply.await?.clone_in_progress());
    }

    let ok = run(&requests, "github.com/foo/bar", &["rev-parse", "HEAD"], b"").await?;
    assert_eq!(ok.result.exit_status, 0);

    wait_for(|| metrics.observed.lock().unwrap().len() == 3).await;
    wait_for(|| !events.sent.lock().unwrap().is_empty()).await;

    let mut observed = metrics.observed.lock().unwrap().clone();
    observed.sort();
    assert_eq!(
        observed,
        vec![
            ("fetch".to_owned(), "github.com/foo/bar".to_owned(), "clone-in-progress".to_owned()),
            ("log".to_owned(), "unknown".to_owned(), "repo-not-found".to_owned()),
            ("rev-parse".to_owned(), "github.com/foo/bar".to_owned(), "0".to_owned()),
        ]
    );
    assert!(metrics.running.lock().unwrap().values().all(|v| *v == 0));

    let sent = events.sent.lock().unwrap().clone();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].repo, "github.com/foo/bar");
    assert_eq!(sent[0].cmd, "rev-parse");
    assert_eq!(sent[0].args, "rev-parse HEAD");
    assert_eq!(sent[0].exit_status, 0);
    assert_eq!(sent[0].stdout_size, 41);
    assert_eq!(sent[0].error, None);
    Ok(())
}
