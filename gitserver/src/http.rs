use std::convert::Infallible;
use std::future::Future;
use std::sync::Arc;

use futures::stream::{self, BoxStream, StreamExt};
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, StatusCode};
use prometheus_client::registry::Registry;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing_futures::Instrument;

use gitserver_core::protocol::{self, ExecReply, ExecRequest, ProcessResult};
use gitserver_core::remote::RemoteOptions;
use gitserver_core::stream::{ChunkReceiver, ChunkSender, CHUNK_SIZE};
use gitserver_core::GitserverResult;

use crate::frame::{self, Frame};

/// Upper bound for the JSON line that starts an exec request body.
pub const MAX_HEADER_LEN: usize = 64 * 1024;

pub struct HttpState {
    pub requests: mpsc::Sender<protocol::Request>,
    pub registry: Registry,
}

#[derive(Deserialize, Debug)]
struct ExecHeader {
    repo: String,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    opt: RemoteOptions,
}

/// Serve the HTTP transport on `listener` until `shutdown` resolves.
pub async fn serve<F>(
    listener: std::net::TcpListener,
    state: Arc<HttpState>,
    shutdown: F,
) -> GitserverResult<()>
where
    F: Future<Output = ()>,
{
    listener.set_nonblocking(true)?;
    tracing::info!(addr = ?listener.local_addr()?, "listening");

    let make_service = make_service_fn(move |_| {
        let state = state.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req| {
                let state = state.clone();
                async move { Ok::<_, Infallible>(route(state, req).await) }
            }))
        }
    });

    hyper::Server::from_tcp(listener)?
        .serve(make_service)
        .with_graceful_shutdown(shutdown)
        .await?;

    Ok(())
}

async fn route(state: Arc<HttpState>, req: Request<Body>) -> Response<Body> {
    match (req.method(), req.uri().path()) {
        (&Method::POST, "/exec") => {
            let span = tracing::debug_span!("http_exec");
            exec(state, req).instrument(span).await
        }
        (&Method::GET, "/metrics") => metrics(&state),
        _ => respond(StatusCode::NOT_FOUND, "not found\n"),
    }
}

fn respond(status: StatusCode, body: impl Into<Body>) -> Response<Body> {
    let mut response = Response::new(body.into());
    *response.status_mut() = status;
    response
}

fn metrics(state: &HttpState) -> Response<Body> {
    let mut buffer = String::new();
    if let Err(e) = prometheus_client::encoding::text::encode(&mut buffer, &state.registry) {
        tracing::error!("failed to encode metrics: {:?}", e);
        return respond(StatusCode::INTERNAL_SERVER_ERROR, "");
    }

    let mut response = respond(StatusCode::OK, buffer);
    response.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static(
            "application/openmetrics-text; version=1.0.0; charset=utf-8",
        ),
    );
    response
}

async fn exec(state: Arc<HttpState>, req: Request<Body>) -> Response<Body> {
    let mut body = req.into_body();

    let (header, rest) = match read_header(&mut body).await {
        Ok(x) => x,
        Err(msg) => {
            tracing::debug!("bad exec header: {}", msg);
            return respond(StatusCode::BAD_REQUEST, format!("{}\n", msg));
        }
    };

    tracing::debug!(repo = %header.repo, args = ?header.args, "exec");

    let (request, handle) = ExecRequest::new(&header.repo, &header.args, header.opt);
    tokio::spawn(forward_stdin(body, rest, handle.stdin).in_current_span());

    // Blocks while the queue is full.
    if state
        .requests
        .send(protocol::Request::Exec(request))
        .await
        .is_err()
    {
        return respond(StatusCode::SERVICE_UNAVAILABLE, "server is shutting down\n");
    }

    let reply = match handle.reply.await {
        Ok(reply) => reply,
        Err(_) => return respond(StatusCode::INTERNAL_SERVER_ERROR, "no reply\n"),
    };

    let frames = reply_frames(reply).map(|frame| frame.encode());
    let mut response = respond(StatusCode::OK, Body::wrap_stream(frames));
    response.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static(frame::CONTENT_TYPE),
    );
    response
}

/// Read the JSON header line. Returns the header and whatever stdin bytes
/// arrived together with it.
async fn read_header(body: &mut Body) -> Result<(ExecHeader, Vec<u8>), String> {
    let mut buffer = Vec::new();

    let line_end = loop {
        if let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
            break pos;
        }
        if buffer.len() > MAX_HEADER_LEN {
            return Err("exec header too long".to_owned());
        }
        match body.next().await {
            Some(Ok(data)) => buffer.extend_from_slice(&data),
            Some(Err(e)) => return Err(format!("failed to read request body: {}", e)),
            None => break buffer.len(),
        }
    };

    let rest = buffer.split_off((line_end + 1).min(buffer.len()));
    let header = serde_json::from_slice(&buffer[..line_end])
        .map_err(|e| format!("invalid exec header: {}", e))?;

    Ok((header, rest))
}

async fn forward_stdin(mut body: Body, rest: Vec<u8>, stdin: ChunkSender) {
    for chunk in rest.chunks(CHUNK_SIZE) {
        if stdin.send(chunk.to_vec()).await.is_err() {
            return;
        }
    }

    while let Some(data) = body.next().await {
        let data = match data {
            Ok(data) => data,
            Err(e) => {
                tracing::warn!("request body aborted: {}", e);
                return;
            }
        };
        for chunk in data.chunks(CHUNK_SIZE) {
            if stdin.send(chunk.to_vec()).await.is_err() {
                return;
            }
        }
    }
}

fn output_frames(rx: ChunkReceiver, wrap: fn(Vec<u8>) -> Frame) -> BoxStream<'static, Frame> {
    stream::unfold(rx, move |mut rx| async move {
        rx.recv().await.map(|chunk| (wrap(chunk), rx))
    })
    .boxed()
}

fn reply_frames(reply: ExecReply) -> BoxStream<'static, Frame> {
    let head = stream::once(futures::future::ready(Frame::Reply(reply.flags())));

    let streams = match reply.into_streams() {
        Some(streams) => streams,
        None => return head.boxed(),
    };

    let output = stream::select(
        output_frames(streams.stdout, Frame::Stdout),
        output_frames(streams.stderr, Frame::Stderr),
    );
    let process_result = streams.process_result;
    let result = stream::once(async move {
        let result = process_result
            .await
            .unwrap_or_else(|_| ProcessResult::not_started("internal error".to_owned()));
        Frame::Result(result)
    });

    head.chain(output).chain(result).boxed()
}
