//! Content-Length framing for JSON-RPC streams.
//!
//! The decoder is push-based: feed it raw bytes as they arrive, pull complete
//! message bodies out. Malformed headers are consumed and reported so the
//! stream can keep going; body parsing (UTF-8, JSON) is the caller's concern.

use serde_json::Value;

use crate::error::{BrokerError, Result};

/// Upper bound on a header section before the decoder declares the stream
/// corrupt rather than buffering forever.
const MAX_HEADER_BYTES: usize = 16 * 1024;

const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";

#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    /// Body length once a complete header section has been parsed.
    pending_body: Option<usize>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append freshly read bytes.
    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Extract the next complete message body, if one is buffered.
    ///
    /// Returns `Ok(None)` when more bytes are needed. A malformed header is
    /// drained from the buffer and reported as an error; calling again
    /// resumes at the next header.
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>> {
        loop {
            let len = match self.pending_body {
                Some(len) => len,
                None => {
                    let Some(header_end) = find_subslice(&self.buf, HEADER_TERMINATOR) else {
                        if self.buf.len() > MAX_HEADER_BYTES {
                            self.buf.clear();
                            return Err(BrokerError::Transport(
                                "header section exceeds maximum size".into(),
                            ));
                        }
                        return Ok(None);
                    };
                    let header = self.buf[..header_end].to_vec();
                    self.buf.drain(..header_end + HEADER_TERMINATOR.len());
                    match parse_content_length(&header) {
                        Some(len) => {
                            self.pending_body = Some(len);
                            len
                        }
                        None => {
                            return Err(BrokerError::Transport(format!(
                                "header section without Content-Length: {:?}",
                                String::from_utf8_lossy(&header)
                            )));
                        }
                    }
                }
            };

            if self.buf.len() < len {
                return Ok(None);
            }
            let body: Vec<u8> = self.buf.drain(..len).collect();
            self.pending_body = None;
            return Ok(Some(body));
        }
    }
}

/// Serialize a message and prepend its framing header. `Content-Length` is
/// the byte length of the UTF-8 encoding.
pub fn encode_message(message: &Value) -> Vec<u8> {
    let body = serde_json::to_vec(message).expect("JSON value serialization cannot fail");
    let mut out = Vec::with_capacity(body.len() + 32);
    out.extend_from_slice(format!("Content-Length: {}\r\n\r\n", body.len()).as_bytes());
    out.extend_from_slice(&body);
    out
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn parse_content_length(header: &[u8]) -> Option<usize> {
    for line in header.split(|&b| b == b'\n') {
        let Ok(line) = std::str::from_utf8(line) else {
            continue;
        };
        let Some((name, value)) = line.trim_end_matches('\r').split_once(':') else {
            continue;
        };
        if name.eq_ignore_ascii_case("content-length") {
            return value.trim().parse().ok();
        }
    }
    None
}
