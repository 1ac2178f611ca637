//! Length-prefixed message framing for the replication wire protocol
//!
//! A framed message is `u32_be(length) || payload` where the length covers
//! only the payload. Zero-length payloads are valid and are delivered as
//! empty messages; the peers use them as keepalives.

use crate::errors::{ReplicationError, ReplicationResult};

/// Default ceiling on a declared frame length.
pub const DEFAULT_FRAME_LIMIT: u64 = u32::MAX as u64;

/// Encode a payload as a single framed byte string.
pub fn marshal(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + payload.len());
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(payload);
    out
}

/// Encode a payload as a (header, payload) pair, enabling vectored writes
/// without copying the payload.
pub fn marshal_parts(payload: &[u8]) -> ([u8; 4], &[u8]) {
    ((payload.len() as u32).to_be_bytes(), payload)
}

/// Stateful decoder for a stream of framed messages.
///
/// Accepts arbitrary byte chunks and yields complete payloads; fragment
/// boundaries carry no meaning. A declared length above the configured
/// limit fails the stream with `MessageTooLarge`.
#[derive(Debug)]
pub struct FrameStream {
    limit: u64,
    data: Vec<u8>,
    length: Option<usize>,
}

impl FrameStream {
    pub fn new() -> Self {
        Self::with_limit(DEFAULT_FRAME_LIMIT)
    }

    pub fn with_limit(limit: u64) -> Self {
        Self {
            limit,
            data: Vec::new(),
            length: None,
        }
    }

    /// Feed a chunk of bytes, returning every payload completed by it, in
    /// arrival order. Empty payloads are returned as empty vectors.
    pub fn push(&mut self, chunk: &[u8]) -> ReplicationResult<Vec<Vec<u8>>> {
        self.data.extend_from_slice(chunk);
        let mut messages = Vec::new();
        loop {
            match self.length {
                Some(length) => {
                    if self.data.len() < length {
                        return Ok(messages);
                    }
                    let rest = self.data.split_off(length);
                    let payload = std::mem::replace(&mut self.data, rest);
                    self.length = None;
                    messages.push(payload);
                }
                None => {
                    if self.data.len() < 4 {
                        return Ok(messages);
                    }
                    let length =
                        u32::from_be_bytes(self.data[..4].try_into().unwrap()) as u64;
                    self.data.drain(..4);
                    if length > self.limit {
                        return Err(ReplicationError::MessageTooLarge {
                            length,
                            limit: self.limit,
                        });
                    }
                    self.length = Some(length as usize);
                }
            }
        }
    }
}

impl Default for FrameStream {
    fn default() -> Self {
        Self::new()
    }
}
