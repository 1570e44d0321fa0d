//! Message normalization.
//!
//! Client message lists arrive in whatever shape the client chose: string
//! content, content-block arrays with image or empty parts, whitespace-only
//! turns, role-only stubs. [`normalize_messages`] rewrites them into the
//! canonical form the upstream accepts, where every message carries a
//! non-empty list of trimmed text blocks. Nothing here fails; a message that
//! cannot be repaired is dropped.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// System prompt prepended to single-turn conversations.
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant.";

/// A single content block. Only text survives normalization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
        /// Other keys the client set on the block (`cache_control`, ...).
        #[serde(flatten)]
        extra: Map<String, Value>,
    },
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text {
            text: text.into(),
            extra: Map::new(),
        }
    }
}

/// A chat message in canonical form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    pub content: Vec<ContentBlock>,
    /// Other client-supplied fields (`name`, `tool_call_id`, ...), forwarded as-is.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ChatMessage {
    fn system(prompt: &str) -> Self {
        Self {
            role: Some("system".into()),
            content: vec![ContentBlock::text(prompt)],
            extra: Map::new(),
        }
    }

    fn is_system(&self) -> bool {
        self.role.as_deref() == Some("system")
    }
}

/// Normalize a raw `messages` value.
///
/// Anything other than a JSON array normalizes to an empty list. When exactly
/// one non-system message survives, [`DEFAULT_SYSTEM_PROMPT`] is prepended.
pub fn normalize_messages(raw: &Value) -> Vec<ChatMessage> {
    let mut out: Vec<ChatMessage> = raw
        .as_array()
        .map(|items| items.iter().filter_map(normalize_message).collect())
        .unwrap_or_default();

    if matches!(out.as_slice(), [only] if !only.is_system()) {
        out.insert(0, ChatMessage::system(DEFAULT_SYSTEM_PROMPT));
    }
    out
}

/// Normalize one message, or `None` if it has nothing worth forwarding.
fn normalize_message(raw: &Value) -> Option<ChatMessage> {
    let obj = raw.as_object()?;
    let content = normalize_content(obj.get("content")?)?;

    let role = obj.get("role").and_then(Value::as_str).map(str::to_owned);
    let extra = obj
        .iter()
        .filter(|(k, _)| k.as_str() != "role" && k.as_str() != "content")
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    Some(ChatMessage { role, content, extra })
}

fn normalize_content(content: &Value) -> Option<Vec<ContentBlock>> {
    let blocks: Vec<ContentBlock> = match content {
        Value::String(s) => {
            let text = s.trim();
            if text.is_empty() {
                return None;
            }
            vec![ContentBlock::text(text)]
        }
        Value::Array(parts) => parts.iter().filter_map(text_block).collect(),
        // null, booleans, numbers and objects carry no usable text
        _ => return None,
    };

    (!blocks.is_empty()).then_some(blocks)
}

fn text_block(part: &Value) -> Option<ContentBlock> {
    if part.get("type").and_then(Value::as_str) != Some("text") {
        return None;
    }
    let text = part.get("text").and_then(Value::as_str)?.trim();
    if text.is_empty() {
        return None;
    }

    let extra = part
        .as_object()?
        .iter()
        .filter(|(k, _)| k.as_str() != "type" && k.as_str() != "text")
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    Some(ContentBlock::Text {
        text: text.to_owned(),
        extra,
    })
}
