//! Server-Sent-Events line framing and usage extraction
//!
//! Upstream chunks arrive at arbitrary byte boundaries. `LineBuffer` splits on
//! `\n` at the byte level, so a multi-byte UTF-8 sequence cut across two
//! chunks is only decoded once the whole line is present. Lines past
//! [`MAX_LINE_BYTES`] are forwarded in pieces and skipped for metering. `UsageExtractor`
//! watches the complete lines for the `message_start` / `message_delta`
//! usage pair.

use bytes::{Bytes, BytesMut};
use serde_json::Value;
use tracing::debug;
use usage::TokenUsage;

/// Longest line buffered before it is forwarded in pieces.
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

/// A forwardable piece of the upstream stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub bytes: Bytes,
    /// False for the pieces of a line longer than the buffer limit. Those are
    /// passed through but never parsed.
    pub whole: bool,
}

/// Accumulates raw bytes and yields complete lines, each ending in `\n`.
#[derive(Debug)]
pub struct LineBuffer {
    pending: BytesMut,
    /// Prefix of `pending` already known to hold no `\n`
    scanned: usize,
    max_line: usize,
    /// Inside a line that already overflowed `max_line`
    overlong: bool,
}

impl Default for LineBuffer {
    fn default() -> Self {
        Self::with_max_line(MAX_LINE_BYTES)
    }
}

impl LineBuffer {
    pub fn with_max_line(max_line: usize) -> Self {
        Self {
            pending: BytesMut::new(),
            scanned: 0,
            max_line,
            overlong: false,
        }
    }

    /// Append `chunk` and return every segment ready to forward. The trailing
    /// partial line stays buffered unless it grew past the limit.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Segment> {
        self.pending.extend_from_slice(chunk);
        let mut out = Vec::new();
        while let Some(offset) = self.pending[self.scanned..].iter().position(|b| *b == b'\n') {
            let end = self.scanned + offset + 1;
            out.push(Segment {
                bytes: self.pending.split_to(end).freeze(),
                whole: !self.overlong,
            });
            self.overlong = false;
            self.scanned = 0;
        }
        self.scanned = self.pending.len();

        if self.pending.len() > self.max_line {
            debug!(buffered = self.pending.len(), "sse line over limit, forwarding unparsed");
            out.push(Segment {
                bytes: self.pending.split().freeze(),
                whole: false,
            });
            self.overlong = true;
            self.scanned = 0;
        }
        out
    }

    /// Take whatever is left after the upstream ended.
    pub fn finish(&mut self) -> Option<Segment> {
        if self.pending.is_empty() {
            return None;
        }
        self.scanned = 0;
        Some(Segment {
            bytes: self.pending.split().freeze(),
            whole: !std::mem::take(&mut self.overlong),
        })
    }
}

/// Usage and model reported by one upstream response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObservedUsage {
    pub model: Option<String>,
    pub tokens: TokenUsage,
}

/// One-shot usage extraction over an SSE stream.
///
/// `message_start` supplies input and cache token counts plus the model; the
/// first `message_delta` carrying `output_tokens` after a `message_start` that
/// reported usage completes the record. Later deltas are ignored.
#[derive(Debug, Default)]
pub struct UsageExtractor {
    observed: ObservedUsage,
    started: bool,
    completed: bool,
}

impl UsageExtractor {
    /// Feed one complete line. Returns the finished usage exactly once.
    pub fn observe_line(&mut self, line: &[u8]) -> Option<ObservedUsage> {
        if self.completed {
            return None;
        }
        let event = parse_data_line(line)?;

        match event.get("type").and_then(Value::as_str) {
            Some("message_start") => {
                let message = event.get("message")?;
                if let Some(usage) = message.get("usage") {
                    let tokens = tokens_from_usage(usage);
                    self.observed.tokens.input_tokens = tokens.input_tokens;
                    self.observed.tokens.cache_creation_tokens = tokens.cache_creation_tokens;
                    self.observed.tokens.cache_read_tokens = tokens.cache_read_tokens;
                    self.started = true;
                }
                if let Some(model) = message.get("model").and_then(Value::as_str) {
                    self.observed.model = Some(model.to_string());
                }
                None
            }
            Some("message_delta") if self.started => {
                let output = event
                    .get("usage")
                    .and_then(|u| u.get("output_tokens"))
                    .and_then(Value::as_u64)?;
                self.observed.tokens.output_tokens = output;
                self.completed = true;
                Some(self.observed.clone())
            }
            _ => None,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.completed
    }

    /// Whatever was seen so far, for a stream that ended early.
    pub fn partial(&self) -> ObservedUsage {
        self.observed.clone()
    }
}

/// Parse a `data: {...}` line. Non-data lines, `[DONE]` and malformed JSON
/// yield `None`.
fn parse_data_line(line: &[u8]) -> Option<Value> {
    let text = String::from_utf8_lossy(line);
    let payload = text.trim_end_matches(['\n', '\r']).strip_prefix("data:")?.trim_start();
    if payload.is_empty() || payload == "[DONE]" {
        return None;
    }
    match serde_json::from_str(payload) {
        Ok(value) => Some(value),
        Err(e) => {
            debug!(error = %e, "ignoring unparseable sse data line");
            None
        }
    }
}

/// Token counts from an Anthropic `usage` object. Missing fields count as 0.
pub fn tokens_from_usage(usage: &Value) -> TokenUsage {
    let field = |name: &str| usage.get(name).and_then(Value::as_u64).unwrap_or(0);
    TokenUsage {
        input_tokens: field("input_tokens"),
        output_tokens: field("output_tokens"),
        cache_creation_tokens: field("cache_creation_input_tokens"),
        cache_read_tokens: field("cache_read_input_tokens"),
    }
}

/// Usage from a buffered (non-streaming) messages response body.
pub fn usage_from_response(body: &[u8]) -> Option<ObservedUsage> {
    let value: Value = serde_json::from_slice(body).ok()?;
    let usage = value.get("usage")?;
    Some(ObservedUsage {
        model: value
            .get("model")
            .and_then(Value::as_str)
            .map(str::to_string),
        tokens: tokens_from_usage(usage),
    })
}
