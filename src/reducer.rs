//! Stream-to-document reducer.
//!
//! The upstream always answers in SSE form (`data: <json>\n\n`, ending with
//! `data: [DONE]`). When the client asked for a plain JSON response, the whole
//! stream is folded here into one [`CompletionDocument`]:
//!
//! 1. [`LineBuffer`] splits the raw byte stream into lines, carrying an
//!    unterminated fragment over to the next read. Lines are only decoded once
//!    complete, so UTF-8 sequences split across reads survive intact.
//! 2. [`CompletionAccumulator`] merges every parsed `data:` payload into the
//!    running state: appended text, per-index tool calls, and last-write-wins
//!    metadata.
//! 3. [`CompletionAccumulator::finish`] assembles the final document.
//!
//! Malformed lines contribute nothing; they never abort the fold.

use std::{borrow::Cow, collections::BTreeMap, pin::pin};

use anyhow::Context;
use bytes::Bytes;
use futures_util::{Stream, StreamExt as _};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

const DATA_PREFIX: &str = "data: ";
const DONE_MARKER: &str = "[DONE]";

// ──────────────────────────────────────────────────────────────────────────────
// Output document
// ──────────────────────────────────────────────────────────────────────────────

/// A complete, non-streamed chat completion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionDocument {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<Choice>,
    pub usage: Usage,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Choice {
    pub index: u32,
    pub message: AssistantMessage,
    pub finish_reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssistantMessage {
    pub role: String,
    /// `null` on the wire when the model produced no text.
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub function: FunctionCall,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    /// Raw JSON text, concatenated from argument fragments.
    pub arguments: String,
}

/// Token counts as reported by the upstream.
///
/// Fields the upstream adds beyond the three counters are kept verbatim. A
/// counter that is `null`, negative or fractional reads as 0.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default, deserialize_with = "lenient_count")]
    pub prompt_tokens: u64,
    #[serde(default, deserialize_with = "lenient_count")]
    pub completion_tokens: u64,
    #[serde(default, deserialize_with = "lenient_count")]
    pub total_tokens: u64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn lenient_count<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(value.as_u64().unwrap_or(0))
}

// ──────────────────────────────────────────────────────────────────────────────
// Line framing
// ──────────────────────────────────────────────────────────────────────────────

/// Splits an arbitrarily-chunked byte stream into lines.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    /// Append `chunk` and hand every line it completes to `on_line`.
    ///
    /// The trailing fragment after the last `\n` stays buffered. Buffered
    /// bytes hold no `\n`, so only the new chunk is searched.
    pub fn feed(&mut self, chunk: &[u8], mut on_line: impl FnMut(&str)) {
        let Some(first) = chunk.iter().position(|&b| b == b'\n') else {
            self.pending.extend_from_slice(chunk);
            return;
        };

        self.pending.extend_from_slice(&chunk[..first]);
        on_line(&decode_line(&self.pending));
        self.pending.clear();

        let mut rest = &chunk[first + 1..];
        while let Some(pos) = rest.iter().position(|&b| b == b'\n') {
            on_line(&decode_line(&rest[..pos]));
            rest = &rest[pos + 1..];
        }
        self.pending.extend_from_slice(rest);
    }

    /// The unterminated remainder, if any, once the input has ended.
    pub fn finish(self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        Some(decode_line(&self.pending).into_owned())
    }
}

fn decode_line(bytes: &[u8]) -> Cow<'_, str> {
    let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
    String::from_utf8_lossy(bytes)
}

// ──────────────────────────────────────────────────────────────────────────────
// Accumulation
// ──────────────────────────────────────────────────────────────────────────────

/// Running state of one fold. Owned by a single request.
#[derive(Debug)]
pub struct CompletionAccumulator {
    id: Option<String>,
    model: Option<String>,
    created: Option<i64>,
    content: String,
    /// Keyed by the upstream's declared index; indices may be sparse.
    tool_calls: BTreeMap<u64, ToolCall>,
    finish_reason: String,
    usage: Usage,
}

impl Default for CompletionAccumulator {
    fn default() -> Self {
        Self::new()
    }
}

impl CompletionAccumulator {
    pub fn new() -> Self {
        Self {
            id: None,
            model: None,
            created: None,
            content: String::new(),
            tool_calls: BTreeMap::new(),
            finish_reason: "stop".into(),
            usage: Usage::default(),
        }
    }

    /// Apply one SSE line. Non-`data:` lines, the `[DONE]` marker and
    /// unparseable payloads are ignored.
    pub fn apply_line(&mut self, line: &str) {
        let Some(payload) = line.strip_prefix(DATA_PREFIX) else {
            return;
        };
        let payload = payload.trim();
        if payload == DONE_MARKER {
            return;
        }

        match serde_json::from_str::<Value>(payload) {
            Ok(chunk) => self.apply_chunk(&chunk),
            Err(e) => debug!(error = %e, len = payload.len(), "skipping unparseable SSE payload"),
        }
    }

    /// Merge one parsed `chat.completion.chunk` object.
    pub fn apply_chunk(&mut self, chunk: &Value) {
        if let Some(id) = non_empty_str(chunk, "id") {
            self.id = Some(id.to_owned());
        }
        if let Some(model) = non_empty_str(chunk, "model") {
            self.model = Some(model.to_owned());
        }
        if let Some(created) = chunk.get("created").and_then(Value::as_i64) {
            self.created = Some(created);
        }
        if let Some(usage) = chunk.get("usage").filter(|u| u.is_object()) {
            // Counters are lenient, so any object replaces the previous usage.
            self.usage = Usage::deserialize(usage).unwrap_or_default();
        }

        let Some(choice) = chunk.pointer("/choices/0") else {
            return;
        };

        if let Some(text) = choice.pointer("/delta/content").and_then(Value::as_str) {
            self.content.push_str(text);
        }
        if let Some(deltas) = choice.pointer("/delta/tool_calls").and_then(Value::as_array) {
            for delta in deltas {
                self.apply_tool_delta(delta);
            }
        }
        if let Some(reason) = choice.get("finish_reason").and_then(Value::as_str) {
            self.finish_reason = reason.to_owned();
        }
    }

    fn apply_tool_delta(&mut self, delta: &Value) {
        let index = delta.get("index").and_then(Value::as_u64).unwrap_or(0);
        let Some(function) = delta.get("function").filter(|f| !f.is_null()) else {
            return;
        };

        if let (Some(id), Some(kind)) = (non_empty_str(delta, "id"), non_empty_str(delta, "type")) {
            let call = ToolCall {
                id: id.to_owned(),
                kind: kind.to_owned(),
                function: FunctionCall {
                    name: str_field(function, "name").unwrap_or_default().to_owned(),
                    arguments: str_field(function, "arguments").unwrap_or_default().to_owned(),
                },
            };
            self.tool_calls.insert(index, call);
            return;
        }

        // Continuation without a started call at this index is dropped.
        let Some(call) = self.tool_calls.get_mut(&index) else {
            debug!(index, "tool-call fragment before its start; dropped");
            return;
        };
        if let Some(arguments) = str_field(function, "arguments") {
            call.function.arguments.push_str(arguments);
        }
        if let Some(name) = non_empty_str(function, "name") {
            call.function.name = name.to_owned();
        }
    }

    /// Assemble the final document. `fallback_model` is used when no chunk
    /// named a model.
    pub fn finish(self, fallback_model: &str) -> CompletionDocument {
        let now = chrono::Utc::now();
        let message = AssistantMessage {
            role: "assistant".into(),
            content: (!self.content.is_empty()).then_some(self.content),
            tool_calls: self.tool_calls.into_values().collect(),
        };

        CompletionDocument {
            id: self
                .id
                .unwrap_or_else(|| format!("chatcmpl-{}", now.timestamp_millis())),
            object: "chat.completion".into(),
            created: self.created.unwrap_or_else(|| now.timestamp()),
            model: self.model.unwrap_or_else(|| fallback_model.to_owned()),
            choices: vec![Choice {
                index: 0,
                message,
                finish_reason: self.finish_reason,
            }],
            usage: self.usage,
        }
    }
}

fn str_field<'a>(value: &'a Value, key: &str) -> Option<&'a str> {
    value.get(key).and_then(Value::as_str)
}

fn non_empty_str<'a>(value: &'a Value, key: &str) -> Option<&'a str> {
    str_field(value, key).filter(|s| !s.is_empty())
}

// ──────────────────────────────────────────────────────────────────────────────
// Driver
// ──────────────────────────────────────────────────────────────────────────────

/// Line framing plus accumulation, fed one chunk at a time.
#[derive(Debug, Default)]
pub struct StreamReducer {
    lines: LineBuffer,
    acc: CompletionAccumulator,
}

impl StreamReducer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, chunk: &[u8]) {
        let acc = &mut self.acc;
        self.lines.feed(chunk, |line| acc.apply_line(line));
    }

    /// Flush any unterminated last line and build the document.
    pub fn finish(mut self, fallback_model: &str) -> CompletionDocument {
        if let Some(tail) = self.lines.finish() {
            self.acc.apply_line(&tail);
        }
        self.acc.finish(fallback_model)
    }
}

/// Drain `stream` completely and reduce it to one [`CompletionDocument`].
///
/// Reading continues past `[DONE]` until the stream itself ends. A transport
/// error aborts the fold.
pub async fn reduce_stream<S, E>(stream: S, fallback_model: &str) -> anyhow::Result<CompletionDocument>
where
    S: Stream<Item = Result<Bytes, E>>,
    E: Into<anyhow::Error>,
{
    let mut stream = pin!(stream);
    let mut reducer = StreamReducer::new();
    let mut chunks = 0usize;

    while let Some(chunk) = stream.next().await {
        let chunk = chunk
            .map_err(Into::<anyhow::Error>::into)
            .context("reading upstream event stream")?;
        reducer.feed(&chunk);
        chunks += 1;
    }

    debug!(chunks, "upstream stream drained");
    Ok(reducer.finish(fallback_model))
}

// ──────────────────────────────────────────────────────────────────────────────
// Tests
// ──────────────────────────────────────────────────────────────────────────────
