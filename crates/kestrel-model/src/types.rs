// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Conversation data model.
//!
//! [`Message`] is the sum type that flows between the query loop, the
//! dispatcher and the transport. Its three variants mirror the three kinds
//! of turn participant: the user (and tool results reported back to the
//! model on the user's behalf), the assistant, and an opaque progress
//! snapshot that is shown to a caller but never replayed to the model.

use serde::{Deserialize, Serialize};

// ─── Content parts ────────────────────────────────────────────────────────────

/// One block of a user message or a tool result.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text { text: String },
    Image {
        /// Data URL (`data:<mime>;base64,<b64>`) or HTTPS URL.
        image_url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
    /// Reported back to the model as part of a user message: the outcome of
    /// a tool the model previously asked to run.
    ToolResult {
        tool_use_id: String,
        content: String,
        is_error: bool,
    },
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn image(image_url: impl Into<String>) -> Self {
        Self::Image { image_url: image_url.into(), detail: None }
    }

    pub fn tool_result(tool_use_id: impl Into<String>, content: impl Into<String>, is_error: bool) -> Self {
        Self::ToolResult { tool_use_id: tool_use_id.into(), content: content.into(), is_error }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text { text } => Some(text),
            _ => None,
        }
    }
}

/// One block of an assistant message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AssistantBlock {
    Text { text: String },
    Image {
        image_url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
    /// A tool invocation the model is requesting.
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
        /// Provider wire-compat sentinel (see design notes: some providers
        /// reject function-call history that lacks this on replay).
        #[serde(default, skip_serializing_if = "Option::is_none")]
        thought_signature: Option<String>,
    },
}

impl AssistantBlock {
    pub fn is_tool_use(&self) -> bool {
        matches!(self, Self::ToolUse { .. })
    }

    pub fn tool_use_id(&self) -> Option<&str> {
        match self {
            Self::ToolUse { id, .. } => Some(id),
            _ => None,
        }
    }
}

// ─── Messages ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub cache_read_tokens: u32,
    pub cache_write_tokens: u32,
}

/// role=user; carries either the user's own text/images, or tool_results the
/// dispatcher produced on the model's behalf (§3 invariant i: every
/// tool_result references a preceding tool_use by id).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserMessage {
    pub content: Vec<ContentBlock>,
}

impl UserMessage {
    pub fn text(text: impl Into<String>) -> Self {
        Self { content: vec![ContentBlock::text(text)] }
    }

    pub fn tool_result(tool_use_id: impl Into<String>, content: impl Into<String>, is_error: bool) -> Self {
        Self { content: vec![ContentBlock::tool_result(tool_use_id, content, is_error)] }
    }

    /// True when the first block is a tool_result — §4.H step 3 forbids
    /// injecting contextual reminders into such a message (it would break
    /// the "function response must be adjacent to function call" wire rule).
    pub fn starts_with_tool_result(&self) -> bool {
        matches!(self.content.first(), Some(ContentBlock::ToolResult { .. }))
    }

    pub fn as_text(&self) -> Option<&str> {
        if self.content.len() == 1 {
            self.content[0].as_text()
        } else {
            None
        }
    }
}

/// role=assistant; carries model output for one turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssistantMessage {
    pub content: Vec<AssistantBlock>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
}

impl AssistantMessage {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![AssistantBlock::Text { text: text.into() }],
            usage: None,
            duration_ms: None,
            trace_id: None,
        }
    }

    pub fn tool_uses(&self) -> impl Iterator<Item = &AssistantBlock> {
        self.content.iter().filter(|b| b.is_tool_use())
    }

    pub fn has_tool_use(&self) -> bool {
        self.content.iter().any(|b| b.is_tool_use())
    }

    /// Plain-text concatenation of all Text blocks (empty if none).
    pub fn as_text(&self) -> String {
        self.content
            .iter()
            .filter_map(|b| match b {
                AssistantBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }

    /// §4.C rule 5: an assistant message with no blocks at all is replaced by
    /// the caller with a sentinel before being folded into history; this
    /// reports whether that sentinel is needed.
    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }
}

/// Opaque progress snapshot for one in-flight tool_use. Never sent back to
/// the model (§3 invariant iii); shown to the caller only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressMessage {
    pub tool_use_id: String,
    pub sibling_tool_use_ids: Vec<String>,
    pub snapshot: String,
}

/// The three kinds of turn participant. See module docs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Message {
    User(UserMessage),
    Assistant(AssistantMessage),
    Progress(ProgressMessage),
}

impl Message {
    pub fn user(text: impl Into<String>) -> Self {
        Self::User(UserMessage::text(text))
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::Assistant(AssistantMessage::text(text))
    }

    pub fn tool_result(tool_use_id: impl Into<String>, content: impl Into<String>, is_error: bool) -> Self {
        Self::User(UserMessage::tool_result(tool_use_id, content, is_error))
    }

    pub fn progress(tool_use_id: impl Into<String>, sibling_tool_use_ids: Vec<String>, snapshot: impl Into<String>) -> Self {
        Self::Progress(ProgressMessage {
            tool_use_id: tool_use_id.into(),
            sibling_tool_use_ids,
            snapshot: snapshot.into(),
        })
    }

    pub fn is_progress(&self) -> bool {
        matches!(self, Self::Progress(_))
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::User(u) => u.as_text(),
            Self::Assistant(a) if a.content.len() == 1 => match &a.content[0] {
                AssistantBlock::Text { text } => Some(text),
                _ => None,
            },
            _ => None,
        }
    }

    /// Approximate token count used by the compaction seam (§4.I).
    /// 4-chars-per-token heuristic, matching the provider-agnostic estimate
    /// this codebase has always used for budget tracking.
    pub fn approx_tokens(&self) -> usize {
        let chars: usize = match self {
            Self::User(u) => u
                .content
                .iter()
                .map(|b| match b {
                    ContentBlock::Text { text } => text.len(),
                    ContentBlock::ToolResult { content, .. } => content.len(),
                    ContentBlock::Image { detail, .. } => {
                        if detail.as_deref() == Some("low") { 85 * 4 } else { 765 * 4 }
                    }
                })
                .sum(),
            Self::Assistant(a) => a
                .content
                .iter()
                .map(|b| match b {
                    AssistantBlock::Text { text } => text.len(),
                    AssistantBlock::ToolUse { name, input, .. } => name.len() + input.to_string().len(),
                    AssistantBlock::Image { detail, .. } => {
                        if detail.as_deref() == Some("low") { 85 * 4 } else { 765 * 4 }
                    }
                })
                .sum(),
            Self::Progress(p) => p.snapshot.len(),
        };
        (chars / 4).max(1)
    }
}

// ─── Model-facing request/response types (component B) ──────────────────────

/// Declared input schema + metadata for one tool, as sent to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDeclaration {
    pub name: String,
    pub description: String,
    /// JSON Schema, sanitised for the wire format (see `sanitize`).
    pub parameters: serde_json::Value,
}

/// Request sent to a model provider (§4.B).
#[derive(Debug, Clone, Default)]
pub struct CompletionRequest {
    pub model: String,
    pub system_instruction: Option<String>,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDeclaration>,
    pub temperature: Option<f32>,
    pub max_output_tokens: Option<u32>,
}

/// One part of a [`ResponseChunk`] (§3 "Response chunk").
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkFunctionCall {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub args: serde_json::Value,
    #[serde(default)]
    pub thought_signature: Option<String>,
}

#[derive(Debug, Clone)]
pub enum ChunkPart {
    Text(String),
    FunctionCall(ChunkFunctionCall),
    /// Reasoning/thinking text, or a bare marker with no text.
    Thought(Option<String>),
}

/// One element of the model stream (§3 "Response chunk", §4.B).
#[derive(Debug, Clone, Default)]
pub struct ResponseChunk {
    pub role: Option<String>,
    pub parts: Vec<ChunkPart>,
    pub usage: Option<Usage>,
    pub trace_id: Option<String>,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    ToolUse,
    StopSequence,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
