//! Framing of an exec reply on a single byte stream.
//!
//! Each frame is a one byte tag, a big-endian `u32` payload length and the
//! payload. A response always starts with a [`Frame::Reply`]; on the
//! streaming branch it continues with interleaved output frames and ends
//! with exactly one [`Frame::Result`].

use gitserver_core::protocol::{ProcessResult, ReplyFlags};
use gitserver_core::{gitserver_error, GitserverResult};

pub const CONTENT_TYPE: &str = "application/x-gitserver-exec";

const HEADER_LEN: usize = 5;

const TAG_REPLY: u8 = 0;
const TAG_STDOUT: u8 = 1;
const TAG_STDERR: u8 = 2;
const TAG_RESULT: u8 = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Reply(ReplyFlags),
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
    Result(ProcessResult),
}

impl Frame {
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        let (tag, payload) = match self {
            Frame::Reply(flags) => (TAG_REPLY, serde_json::to_vec(flags)?),
            Frame::Stdout(data) => (TAG_STDOUT, data.clone()),
            Frame::Stderr(data) => (TAG_STDERR, data.clone()),
            Frame::Result(result) => (TAG_RESULT, serde_json::to_vec(result)?),
        };

        let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
        out.push(tag);
        out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        out.extend_from_slice(&payload);
        Ok(out)
    }
}

/// Incremental decoder for a frame stream arriving in arbitrary pieces.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Bytes received that do not form a complete frame yet.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    pub fn next_frame(&mut self) -> GitserverResult<Option<Frame>> {
        if self.buf.len() < HEADER_LEN {
            return Ok(None);
        }

        let tag = self.buf[0];
        let len = u32::from_be_bytes([self.buf[1], self.buf[2], self.buf[3], self.buf[4]]) as usize;
        if self.buf.len() < HEADER_LEN + len {
            return Ok(None);
        }

        let rest = self.buf.split_off(HEADER_LEN + len);
        let payload = self.buf.split_off(HEADER_LEN);
        self.buf = rest;

        let frame = match tag {
            TAG_REPLY => Frame::Reply(serde_json::from_slice(&payload)?),
            TAG_STDOUT => Frame::Stdout(payload),
            TAG_STDERR => Frame::Stderr(payload),
            TAG_RESULT => Frame::Result(serde_json::from_slice(&payload)?),
            other => return Err(gitserver_error(&format!("unknown frame tag {}", other))),
        };

        Ok(Some(frame))
    }
}
