//! Newline-delimited JSON framing for the control channel (spec §4.A).

use std::collections::HashMap;

use base64::Engine;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{RelayError, Result};

/// Hop-by-hop headers stripped from response frames before they are
/// written back to the public caller.
const HOP_BY_HOP_HEADERS: &[&str] = &["connection", "keep-alive", "transfer-encoding", "upgrade"];

/// A single control-channel message. Tagged by `type`, matching the
/// wire shape other reverse-tunnel implementations in this pack use for
/// their duplex-stream protocols.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Frame {
    #[serde(rename = "register")]
    Register { token: String, #[serde(rename = "targetPort")] target_port: u16 },
    #[serde(rename = "registered")]
    Registered,
    #[serde(rename = "error")]
    Error { message: String },
    #[serde(rename = "request")]
    Request {
        id: String,
        method: String,
        path: String,
        headers: HashMap<String, String>,
        body: String,
    },
    #[serde(rename = "response")]
    Response {
        id: String,
        status: u16,
        headers: HashMap<String, String>,
        body: String,
    },
}

impl Frame {
    /// Serialize to a single line (no trailing newline).
    pub fn to_line(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| RelayError::MalformedFrame(e.to_string()))
    }

    pub fn request(id: &str, method: &str, path: &str, headers: HashMap<String, String>, body: &[u8]) -> Self {
        Frame::Request {
            id: id.to_string(),
            method: method.to_string(),
            path: path.to_string(),
            headers,
            body: base64::engine::general_purpose::STANDARD.encode(body),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Frame::Error { message: message.into() }
    }
}

/// Decode a frame's base64 body. Returns empty bytes on decode failure
/// rather than erroring — a malformed body must not abort a response that
/// otherwise has a valid status and headers (spec §4.A).
pub fn decode_body(body: &str) -> Vec<u8> {
    base64::engine::general_purpose::STANDARD
        .decode(body)
        .unwrap_or_default()
}

/// Strips hop-by-hop headers from a response header map in place.
/// Malformed header names are simply skipped by the caller when
/// converting to real `HeaderMap` values; this function only removes the
/// disallowed keys.
pub fn strip_hop_by_hop(headers: &mut HashMap<String, String>) {
    headers.retain(|k, _| !HOP_BY_HOP_HEADERS.contains(&k.to_ascii_lowercase().as_str()));
}

/// Key substrings that mark a header value as sensitive for logging
/// purposes (spec §7: "secrets redacted by substring match on keys").
const SENSITIVE_KEY_SUBSTRINGS: &[&str] = &["secret", "token", "password", "authorization"];

/// Returns a copy of `headers` with sensitive values replaced by a
/// placeholder, safe to pass to `tracing` at debug level. Never used on the
/// live headers forwarded to a client or caller — only on log output.
pub fn redact_for_logging(headers: &HashMap<String, String>) -> HashMap<String, String> {
    headers
        .iter()
        .map(|(k, v)| {
            let lower = k.to_ascii_lowercase();
            if SENSITIVE_KEY_SUBSTRINGS.iter().any(|s| lower.contains(s)) {
                (k.clone(), "<redacted>".to_string())
            } else {
                (k.clone(), v.clone())
            }
        })
        .collect()
}

/// Accumulates bytes from an async byte stream and yields one `Frame` per
/// completed (`\n`-terminated) line, enforcing `max_frame_size` on each
/// candidate line before attempting to parse it. A partial line left in
/// the buffer at EOF is discarded (spec §4.A).
pub struct FrameReader<R> {
    inner: R,
    buf: Vec<u8>,
    max_frame_size: usize,
    read_buf: [u8; 8192],
}

/// Outcome of a single `FrameReader::next_frame` call.
#[derive(Debug)]
pub enum ReadOutcome {
    Frame(Frame),
    /// The line exceeded `max_frame_size`; caller should send an `error`
    /// frame and close the stream.
    TooLarge,
    /// A line parsed but was not valid JSON / not a recognized frame type.
    Malformed(String),
    Eof,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R, max_frame_size: usize) -> Self {
        Self { inner, buf: Vec::new(), max_frame_size, read_buf: [0u8; 8192] }
    }

    /// Reads until a full line is available, parses it, and returns the
    /// outcome. Buffers any bytes read past the newline for the next call.
    pub async fn next_frame(&mut self) -> Result<ReadOutcome> {
        loop {
            if let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = self.buf.drain(..=pos).collect();
                let line = &line[..line.len() - 1]; // drop the newline
                if line.len() > self.max_frame_size {
                    return Ok(ReadOutcome::TooLarge);
                }
                if line.is_empty() {
                    continue;
                }
                return match serde_json::from_slice::<Frame>(line) {
                    Ok(frame) => Ok(ReadOutcome::Frame(frame)),
                    Err(e) => Ok(ReadOutcome::Malformed(e.to_string())),
                };
            }

            if self.buf.len() > self.max_frame_size {
                // No newline yet but already oversize: drain what we have
                // so the caller can reject and close without unbounded growth.
                self.buf.clear();
                return Ok(ReadOutcome::TooLarge);
            }

            let n = self
                .inner
                .read(&mut self.read_buf)
                .await
                .map_err(RelayError::Io)?;
            if n == 0 {
                return Ok(ReadOutcome::Eof);
            }
            self.buf.extend_from_slice(&self.read_buf[..n]);
        }
    }
}
