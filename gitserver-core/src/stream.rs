//! Chunked byte streams used to carry process stdio between the server and
//! its callers.
//!
//! A stream is a bounded [`mpsc`] channel of byte chunks. Senders block once
//! [`STREAM_DEPTH`] chunks are queued, so a slow consumer throttles the
//! producing process instead of growing memory. Closing the channel (dropping
//! the sender) is the end-of-stream signal.

use std::io::ErrorKind;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

/// Upper bound on the size of a single chunk.
pub const CHUNK_SIZE: usize = 32 * 1024;

/// Number of chunks that may be in flight before the producer blocks.
pub const STREAM_DEPTH: usize = 4;

pub type ChunkSender = mpsc::Sender<Vec<u8>>;
pub type ChunkReceiver = mpsc::Receiver<Vec<u8>>;

pub fn chunk_channel() -> (ChunkSender, ChunkReceiver) {
    mpsc::channel(STREAM_DEPTH)
}

/// Copy everything `reader` yields onto `tx` in chunks of at most
/// [`CHUNK_SIZE`] bytes and return the number of bytes read.
///
/// If the receiving side goes away the remaining output is still read and
/// discarded, so the writing process never stalls on a full pipe. `tx` is
/// dropped on return, which closes the stream.
pub async fn pump_output<R>(mut reader: R, tx: ChunkSender) -> std::io::Result<u64>
where
    R: AsyncRead + Unpin,
{
    let mut tx = Some(tx);
    let mut written: u64 = 0;
    let mut buf = vec![0u8; CHUNK_SIZE];

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => return Ok(written),
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        written += n as u64;

        if let Some(sender) = &tx {
            if sender.send(buf[..n].to_vec()).await.is_err() {
                tracing::debug!("output consumer went away, discarding");
                tx = None;
            }
        }
    }
}

/// Feed chunks from `rx` into `writer` until the stream ends, then shut the
/// writer down so the reading side sees EOF.
///
/// Stops early with `Ok` when the writer reports a broken pipe: the process
/// is allowed to exit without consuming its input. Whatever is left on `rx`
/// is the caller's to drain.
pub async fn feed_input<W>(rx: &mut ChunkReceiver, mut writer: W) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let result = async {
        while let Some(chunk) = rx.recv().await {
            writer.write_all(&chunk).await?;
        }
        writer.shutdown().await
    }
    .await;

    match result {
        Err(e) if e.kind() == ErrorKind::BrokenPipe => Ok(()),
        other => other,
    }
}

/// Receive and discard everything left on `rx` until the sender closes it.
pub async fn drain(rx: &mut ChunkReceiver) -> u64 {
    let mut discarded = 0;
    while let Some(chunk) = rx.recv().await {
        discarded += chunk.len() as u64;
    }
    discarded
}
