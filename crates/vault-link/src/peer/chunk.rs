//! Text framing for large payloads on the peer channel.
//!
//! A payload too large for one data-channel frame arrives as any number of
//! `CHUNK_<KIND>:<text>` fragments followed by a bare `END_<KIND>` marker.
//! Fragments of one kind are concatenated in arrival order and the result is
//! parsed as a single JSON document. Kinds are independent, so a `TREE`
//! sequence may interleave with a `FILE` sequence.

use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};

use serde_json::Value;
use thiserror::Error;

use crate::config::{millis_env, parse_u64_env};

pub const CHUNK_PREFIX: &str = "CHUNK_";
pub const END_PREFIX: &str = "END_";
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 64 * 1024 * 1024;
pub const DEFAULT_GC_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_MAX_INFLIGHT: usize = 8;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChunkConfig {
    /// Upper bound on the accumulated text of one sequence.
    pub max_message_bytes: usize,
    /// Open sequences held at once; opening one more evicts the stalest.
    pub max_inflight: usize,
    /// Sequences with no fragment for this long are discarded.
    pub gc_timeout: Duration,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
            max_inflight: DEFAULT_MAX_INFLIGHT,
            gc_timeout: DEFAULT_GC_TIMEOUT,
        }
    }
}

impl ChunkConfig {
    pub fn from_env() -> Self {
        let max_message_bytes = parse_u64_env(
            "VAULT_LINK_MAX_MESSAGE_BYTES",
            DEFAULT_MAX_MESSAGE_BYTES as u64,
            1,
        )
        .map(|value| value as usize)
        .unwrap_or(DEFAULT_MAX_MESSAGE_BYTES);
        let max_inflight = parse_u64_env(
            "VAULT_LINK_MAX_INFLIGHT_SEQUENCES",
            DEFAULT_MAX_INFLIGHT as u64,
            1,
        )
        .map(|value| value as usize)
        .unwrap_or(DEFAULT_MAX_INFLIGHT);
        Self {
            max_message_bytes,
            max_inflight,
            gc_timeout: millis_env("VAULT_LINK_REASSEMBLY_TIMEOUT_MS", DEFAULT_GC_TIMEOUT),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChunkError {
    #[error("{kind} payload exceeds max size: {bytes} bytes")]
    MessageTooLarge { kind: ChunkKind, bytes: usize },
    #[error("{kind} payload is not valid json: {reason}")]
    InvalidJson { kind: ChunkKind, reason: String },
    #[error("END_{kind} received with no open sequence")]
    UnexpectedEnd { kind: ChunkKind },
}

/// Payload class carried in the frame tag. `TREE` and `FILE` are what vaults
/// send today; any other upper-case tag is accepted as its own kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ChunkKind {
    Tree,
    File,
    Other(String),
}

impl ChunkKind {
    pub fn parse(tag: &str) -> Option<Self> {
        if tag.is_empty()
            || !tag
                .bytes()
                .all(|b| b.is_ascii_uppercase() || b.is_ascii_digit() || b == b'_')
        {
            return None;
        }
        Some(match tag {
            "TREE" => ChunkKind::Tree,
            "FILE" => ChunkKind::File,
            other => ChunkKind::Other(other.to_string()),
        })
    }

    pub fn as_str(&self) -> &str {
        match self {
            ChunkKind::Tree => "TREE",
            ChunkKind::File => "FILE",
            ChunkKind::Other(tag) => tag,
        }
    }
}

impl fmt::Display for ChunkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One inbound text frame, classified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame<'a> {
    Chunk { kind: ChunkKind, part: &'a str },
    End { kind: ChunkKind },
    Message(&'a str),
}

pub fn classify(text: &str) -> Frame<'_> {
    if let Some(rest) = text.strip_prefix(CHUNK_PREFIX) {
        if let Some((tag, part)) = rest.split_once(':') {
            if let Some(kind) = ChunkKind::parse(tag) {
                return Frame::Chunk { kind, part };
            }
        }
    }
    if let Some(tag) = text.strip_prefix(END_PREFIX) {
        if let Some(kind) = ChunkKind::parse(tag) {
            return Frame::End { kind };
        }
    }
    Frame::Message(text)
}

/// Renders `payload` as the frames a vault would send for it, splitting the
/// text into fragments of at most `fragment_len` bytes.
pub fn split_message(kind: &ChunkKind, payload: &str, fragment_len: usize) -> Vec<String> {
    let fragment_len = fragment_len.max(1);
    let mut frames = Vec::new();
    let mut rest = payload;
    while !rest.is_empty() {
        let mut cut = fragment_len.min(rest.len());
        while !rest.is_char_boundary(cut) {
            cut += 1;
        }
        let (head, tail) = rest.split_at(cut);
        frames.push(format!("{CHUNK_PREFIX}{kind}:{head}"));
        rest = tail;
    }
    frames.push(format!("{END_PREFIX}{kind}"));
    frames
}

#[derive(Debug, Clone, PartialEq)]
pub struct Reassembled {
    pub kind: ChunkKind,
    pub message: Value,
    pub fragments: u32,
    pub started_at: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcReason {
    Timeout,
    Capacity,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GcEvent {
    pub kind: ChunkKind,
    pub dropped_bytes: usize,
    pub reason: GcReason,
}

#[derive(Debug)]
struct PartialBuffer {
    started_at: Instant,
    last_fragment_at: Instant,
    text: String,
    fragments: u32,
    overflowed: bool,
}

impl PartialBuffer {
    fn new(now: Instant) -> Self {
        Self {
            started_at: now,
            last_fragment_at: now,
            text: String::new(),
            fragments: 0,
            overflowed: false,
        }
    }
}

pub struct Reassembler {
    buffers: HashMap<ChunkKind, PartialBuffer>,
    config: ChunkConfig,
}

impl Reassembler {
    pub fn new(config: ChunkConfig) -> Self {
        Self {
            buffers: HashMap::new(),
            config,
        }
    }

    /// Appends one fragment to the open sequence for `kind`, opening it if needed.
    ///
    /// Opening a sequence while `max_inflight` are already open evicts the one
    /// that has been idle longest; the eviction is returned. A sequence that
    /// grows past `max_message_bytes` is emptied and reported once; its
    /// remaining fragments and terminator are swallowed.
    pub fn push(
        &mut self,
        kind: ChunkKind,
        part: &str,
        now: Instant,
    ) -> Result<Option<GcEvent>, ChunkError> {
        let max = self.config.max_message_bytes;
        let evicted = if !self.buffers.contains_key(&kind)
            && self.buffers.len() >= self.config.max_inflight.max(1)
        {
            self.evict_stalest()
        } else {
            None
        };
        let buffer = self
            .buffers
            .entry(kind.clone())
            .or_insert_with(|| PartialBuffer::new(now));
        buffer.last_fragment_at = now;
        buffer.fragments = buffer.fragments.saturating_add(1);
        if buffer.overflowed {
            return Ok(evicted);
        }
        let bytes = buffer.text.len().saturating_add(part.len());
        if bytes > max {
            buffer.overflowed = true;
            buffer.text = String::new();
            return Err(ChunkError::MessageTooLarge { kind, bytes });
        }
        buffer.text.push_str(part);
        Ok(evicted)
    }

    fn evict_stalest(&mut self) -> Option<GcEvent> {
        let kind = self
            .buffers
            .iter()
            .min_by_key(|(_, buffer)| buffer.last_fragment_at)
            .map(|(kind, _)| kind.clone())?;
        let buffer = self.buffers.remove(&kind)?;
        Some(GcEvent {
            kind,
            dropped_bytes: buffer.text.len(),
            reason: GcReason::Capacity,
        })
    }

    pub fn open_sequences(&self) -> usize {
        self.buffers.len()
    }

    /// Closes the sequence for `kind` and parses it. The buffer is gone
    /// afterwards whatever the outcome.
    pub fn finish(&mut self, kind: ChunkKind) -> Result<Option<Reassembled>, ChunkError> {
        let Some(buffer) = self.buffers.remove(&kind) else {
            return Err(ChunkError::UnexpectedEnd { kind });
        };
        if buffer.overflowed {
            return Ok(None);
        }
        let message = serde_json::from_str::<Value>(&buffer.text).map_err(|err| {
            ChunkError::InvalidJson {
                kind: kind.clone(),
                reason: err.to_string(),
            }
        })?;
        Ok(Some(Reassembled {
            kind,
            message,
            fragments: buffer.fragments,
            started_at: buffer.started_at,
        }))
    }

    pub fn gc(&mut self, now: Instant) -> Vec<GcEvent> {
        let timeout = self.config.gc_timeout;
        let mut dropped = Vec::new();
        self.buffers.retain(|kind, buffer| {
            let expired = now.saturating_duration_since(buffer.last_fragment_at) > timeout;
            if expired {
                dropped.push(GcEvent {
                    kind: kind.clone(),
                    dropped_bytes: buffer.text.len(),
                    reason: GcReason::Timeout,
                });
            }
            !expired
        });
        dropped
    }

    pub fn is_open(&self, kind: &ChunkKind) -> bool {
        self.buffers.contains_key(kind)
    }

    pub fn buffered_bytes(&self, kind: &ChunkKind) -> usize {
        self.buffers.get(kind).map_or(0, |buffer| buffer.text.len())
    }
}
