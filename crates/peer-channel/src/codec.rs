use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_BLOCK_SIZE: usize = 32 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadKind {
    Text,
    Binary,
}

/// A logical message handed to `PeerChannel::send` or surfaced on receive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Text(String),
    Binary(Bytes),
}

impl Payload {
    pub fn kind(&self) -> PayloadKind {
        match self {
            Payload::Text(_) => PayloadKind::Text,
            Payload::Binary(_) => PayloadKind::Binary,
        }
    }

    /// Length in bytes. Text is measured in its UTF-8 encoding.
    pub fn len(&self) -> usize {
        match self {
            Payload::Text(text) => text.len(),
            Payload::Binary(bytes) => bytes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn to_bytes(&self) -> Bytes {
        match self {
            Payload::Text(text) => Bytes::copy_from_slice(text.as_bytes()),
            Payload::Binary(bytes) => bytes.clone(),
        }
    }
}

impl From<String> for Payload {
    fn from(value: String) -> Self {
        Payload::Text(value)
    }
}

impl From<&str> for Payload {
    fn from(value: &str) -> Self {
        Payload::Text(value.to_owned())
    }
}

impl From<Vec<u8>> for Payload {
    fn from(value: Vec<u8>) -> Self {
        Payload::Binary(Bytes::from(value))
    }
}

impl From<Bytes> for Payload {
    fn from(value: Bytes) -> Self {
        Payload::Binary(value)
    }
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("block size must be greater than zero")]
    InvalidBlockSize,
    #[error("malformed transfer header: {0}")]
    MalformedHeader(#[from] serde_json::Error),
    #[error("text payload is not valid utf-8: {0}")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),
}

/// Announces how many data blocks follow and how to interpret them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferHeader {
    pub count: u64,
    pub kind: PayloadKind,
}

impl TransferHeader {
    pub fn encode(&self) -> String {
        // Two plain fields; serializing cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn decode(raw: &[u8]) -> Result<Self, CodecError> {
        Ok(serde_json::from_slice(raw)?)
    }
}

#[derive(Debug, Clone)]
pub struct ChunkPlan {
    pub header: TransferHeader,
    pub blocks: Vec<Bytes>,
    pub total_bytes: usize,
}

pub fn block_count(len: usize, block_size: usize) -> u64 {
    len.div_ceil(block_size) as u64
}

/// Cuts a payload into `block_size` slices. Every block but the last is full.
pub fn split(payload: &Payload, block_size: usize) -> Result<ChunkPlan, CodecError> {
    if block_size == 0 {
        return Err(CodecError::InvalidBlockSize);
    }
    let bytes = payload.to_bytes();
    let total_bytes = bytes.len();
    let blocks: Vec<Bytes> = (0..total_bytes)
        .step_by(block_size)
        .map(|start| bytes.slice(start..(start + block_size).min(total_bytes)))
        .collect();
    Ok(ChunkPlan {
        header: TransferHeader {
            count: blocks.len() as u64,
            kind: payload.kind(),
        },
        blocks,
        total_bytes,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiveInfo {
    pub size: usize,
    pub duration: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub payload: Payload,
    pub info: ReceiveInfo,
}

/// Receive-side state machine. While idle the next message is parsed as a
/// header; afterwards the announced number of blocks is buffered and joined.
#[derive(Debug)]
pub struct ReceiveSession {
    started_at: Instant,
    expected: u64,
    received: u64,
    kind: PayloadKind,
    blocks: Vec<Bytes>,
    buffered_bytes: usize,
}

impl Default for ReceiveSession {
    fn default() -> Self {
        Self {
            started_at: Instant::now(),
            expected: 0,
            received: 0,
            kind: PayloadKind::Binary,
            blocks: Vec::new(),
            buffered_bytes: 0,
        }
    }
}

impl ReceiveSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_idle(&self) -> bool {
        self.received == self.expected
    }

    /// Bytes buffered for the transfer in progress.
    pub fn buffered_bytes(&self) -> usize {
        self.buffered_bytes
    }

    pub fn ingest(&mut self, message: Bytes, now: Instant) -> Result<Option<Delivery>, CodecError> {
        if self.is_idle() {
            let header = TransferHeader::decode(&message)?;
            self.started_at = now;
            self.expected = header.count;
            self.received = 0;
            self.kind = header.kind;
            if header.count == 0 {
                return self.finish(now).map(Some);
            }
            return Ok(None);
        }

        self.buffered_bytes += message.len();
        self.blocks.push(message);
        self.received += 1;
        if self.is_idle() {
            return self.finish(now).map(Some);
        }
        Ok(None)
    }

    fn finish(&mut self, now: Instant) -> Result<Delivery, CodecError> {
        let blocks = std::mem::take(&mut self.blocks);
        let size = std::mem::take(&mut self.buffered_bytes);
        let joined = match blocks.len() {
            1 => blocks.into_iter().next().unwrap_or_default(),
            _ => {
                let mut joined = BytesMut::with_capacity(size);
                for block in &blocks {
                    joined.extend_from_slice(block);
                }
                joined.freeze()
            }
        };
        let payload = match self.kind {
            PayloadKind::Text => Payload::Text(String::from_utf8(joined.to_vec())?),
            PayloadKind::Binary => Payload::Binary(joined),
        };
        Ok(Delivery {
            payload,
            info: ReceiveInfo {
                size,
                duration: now.saturating_duration_since(self.started_at),
            },
        })
    }
}
