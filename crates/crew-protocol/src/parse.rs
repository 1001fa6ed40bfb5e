//! Decoding the agent's line-delimited JSON output.
//!
//! The agent writes one JSON value per line on stdout. Lines may end in
//! `\n`, `\r` or `\r\n`, may carry terminal control characters, and are not
//! guaranteed to be valid JSON (progress noise, truncated writes). Every
//! line is parsed independently; a bad line is reported as
//! [`ParsedLine::Skipped`] and decoding continues with the next one.
//!
//! ```text
//! bytes ─▶ split on \n|\r ─▶ lossy UTF-8 ─▶ strip controls ─▶ trim ─▶ JSON
//!                                                                     │
//!             ┌──────────────────────────┬───────────────────────────┤
//!             ▼                          ▼                           ▼
//!     type=system/init            type=result                 anything else
//!     AgentRecord::Init           AgentRecord::Result         AgentRecord::Payload
//! ```

use crew_core::SessionId;
use serde_json::Value;
use std::io;
use tokio_util::bytes::{Buf, BytesMut};
use tokio_util::codec::Decoder;
use tracing::warn;

/// Longest line accepted before it is skipped (1 MiB).
pub const MAX_LINE_LENGTH: usize = 1024 * 1024;

/// Characters of a rejected line kept for diagnostics.
const PREVIEW_CHARS: usize = 120;

// ============================================================================
// Records
// ============================================================================

/// One structured record emitted by the agent.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentRecord {
    /// `{"type":"system","subtype":"init","session_id":...}`: the
    /// authoritative session id.
    Init { session_id: SessionId, record: Value },

    /// `{"type":"result",...}`: the agent finished a turn.
    Result(Value),

    /// Any other JSON value, forwarded verbatim.
    Payload(Value),
}

impl AgentRecord {
    /// Classifies a decoded JSON value.
    pub fn classify(record: Value) -> Self {
        let kind = record.get("type").and_then(Value::as_str);
        match kind {
            Some("system") if record.get("subtype").and_then(Value::as_str) == Some("init") => {
                match record
                    .get("session_id")
                    .and_then(Value::as_str)
                    .filter(|id| !id.is_empty())
                {
                    Some(id) => Self::Init {
                        session_id: SessionId::new(id),
                        record,
                    },
                    None => Self::Payload(record),
                }
            }
            Some("result") => Self::Result(record),
            _ => Self::Payload(record),
        }
    }

    /// The raw JSON value.
    pub fn record(&self) -> &Value {
        match self {
            Self::Init { record, .. } | Self::Result(record) | Self::Payload(record) => record,
        }
    }

    /// Model name reported by an init record, if any.
    pub fn model(&self) -> Option<&str> {
        match self {
            Self::Init { record, .. } => record.get("model").and_then(Value::as_str),
            _ => None,
        }
    }

    /// True when a `result` record reports an error.
    pub fn is_error_result(&self) -> bool {
        match self {
            Self::Result(record) => record
                .get("is_error")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            _ => false,
        }
    }
}

/// Why a line was not turned into a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseSkipped {
    /// The sanitized line was not valid JSON.
    NotJson { preview: String, error: String },

    /// The line exceeded [`MAX_LINE_LENGTH`] and was discarded.
    TooLong { length: usize },
}

impl std::fmt::Display for ParseSkipped {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotJson { preview, error } => write!(f, "not JSON ({error}): {preview}"),
            Self::TooLong { length } => {
                write!(f, "line of {length} bytes exceeds {MAX_LINE_LENGTH}")
            }
        }
    }
}

/// Result of decoding one non-empty line.
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedLine {
    Record(AgentRecord),
    Skipped(ParseSkipped),
}

// ============================================================================
// Line helpers
// ============================================================================

/// Drops control characters (tab excepted) and surrounding whitespace.
pub fn sanitize_line(line: &str) -> String {
    line.chars()
        .filter(|ch| *ch == '\t' || !ch.is_control())
        .collect::<String>()
        .trim()
        .to_string()
}

/// Parses one raw line. Returns `None` for lines that are empty after
/// sanitizing.
pub fn parse_line(raw: &str) -> Option<ParsedLine> {
    let line = sanitize_line(raw);
    if line.is_empty() {
        return None;
    }
    match serde_json::from_str::<Value>(&line) {
        Ok(value) => Some(ParsedLine::Record(AgentRecord::classify(value))),
        Err(e) => Some(ParsedLine::Skipped(ParseSkipped::NotJson {
            preview: line.chars().take(PREVIEW_CHARS).collect(),
            error: e.to_string(),
        })),
    }
}

// ============================================================================
// Codec
// ============================================================================

/// Frames agent stdout into [`ParsedLine`]s.
///
/// Create one codec per process attachment; it keeps partial-line state.
#[derive(Debug, Clone)]
pub struct AgentLineCodec {
    max_length: usize,
    /// Bytes already scanned for a delimiter.
    next_index: usize,
    /// Set while discarding the rest of an oversized line.
    discarding: Option<usize>,
    skipped: u64,
}

impl AgentLineCodec {
    pub fn new() -> Self {
        Self::with_max_length(MAX_LINE_LENGTH)
    }

    pub fn with_max_length(max_length: usize) -> Self {
        Self {
            max_length: max_length.max(1),
            next_index: 0,
            discarding: None,
            skipped: 0,
        }
    }

    /// Number of lines skipped so far.
    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    fn finish_line(&mut self, line: &[u8]) -> Option<ParsedLine> {
        let parsed = parse_line(&String::from_utf8_lossy(line))?;
        if let ParsedLine::Skipped(reason) = &parsed {
            self.record_skip(reason);
        }
        Some(parsed)
    }

    fn too_long(&mut self, length: usize) -> ParsedLine {
        let reason = ParseSkipped::TooLong { length };
        self.record_skip(&reason);
        ParsedLine::Skipped(reason)
    }

    fn record_skip(&mut self, reason: &ParseSkipped) {
        self.skipped = self.skipped.saturating_add(1);
        warn!(skipped = self.skipped, reason = %reason, "Skipping unparseable agent output line");
    }
}

impl Default for AgentLineCodec {
    fn default() -> Self {
        Self::new()
    }
}

fn find_delimiter(buf: &[u8], from: usize) -> Option<usize> {
    buf.get(from..)?
        .iter()
        .position(|b| *b == b'\n' || *b == b'\r')
        .map(|offset| from + offset)
}

impl Decoder for AgentLineCodec {
    type Item = ParsedLine;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<ParsedLine>, io::Error> {
        loop {
            let delimiter = find_delimiter(buf, self.next_index);

            if let Some(discarded) = self.discarding {
                match delimiter {
                    Some(index) => {
                        buf.advance(index + 1);
                        self.next_index = 0;
                        self.discarding = None;
                        return Ok(Some(self.too_long(discarded.saturating_add(index))));
                    }
                    None => {
                        self.discarding = Some(discarded.saturating_add(buf.len()));
                        buf.advance(buf.len());
                        self.next_index = 0;
                        return Ok(None);
                    }
                }
            }

            match delimiter {
                Some(index) if index > self.max_length => {
                    buf.advance(index + 1);
                    self.next_index = 0;
                    return Ok(Some(self.too_long(index)));
                }
                Some(index) => {
                    let line = buf.split_to(index);
                    buf.advance(1);
                    self.next_index = 0;
                    if let Some(parsed) = self.finish_line(&line) {
                        return Ok(Some(parsed));
                    }
                    // Empty line (e.g. the `\n` of `\r\n`); keep scanning.
                }
                None if buf.len() > self.max_length => {
                    self.discarding = Some(buf.len());
                    buf.advance(buf.len());
                    self.next_index = 0;
                    return Ok(None);
                }
                None => {
                    self.next_index = buf.len();
                    return Ok(None);
                }
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<ParsedLine>, io::Error> {
        if let Some(parsed) = self.decode(buf)? {
            return Ok(Some(parsed));
        }
        self.next_index = 0;
        if let Some(discarded) = self.discarding.take() {
            buf.clear();
            return Ok(Some(self.too_long(discarded)));
        }
        if buf.is_empty() {
            return Ok(None);
        }
        let line = buf.split_to(buf.len());
        Ok(self.finish_line(&line))
    }
}
