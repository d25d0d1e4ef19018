// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;

use async_trait::async_trait;
use serde_json::Value;

use crate::policy::ApprovalPolicy;

/// A single tool invocation requested by the model.
#[derive(Debug, Clone)]
pub struct ToolCall {
    /// Opaque identifier returned by the model (forwarded verbatim)
    pub id: String,
    pub name: String,
    /// Parsed JSON arguments
    pub args: Value,
}

/// A single content item in a rich tool output.
///
/// Most tools produce only `Text`.  Vision-capable tools may produce a mix of
/// `Text` and `Image` items.
#[derive(Debug, Clone)]
pub enum ToolOutputPart {
    /// Plain UTF-8 text.
    Text(String),
    /// Base64 data URL: `data:<mime>;base64,<b64>`.
    Image(String),
}

/// The result of executing a tool.
///
/// `content` is always the plain-text representation of the output (the
/// concatenation of all `Text` parts); `parts` additionally carries any
/// non-text content (e.g. images) a tool produced.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub call_id: String,
    pub content: String,
    pub parts: Vec<ToolOutputPart>,
    pub is_error: bool,
}

impl ToolOutput {
    /// Successful plain-text result.
    pub fn ok(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        let text = content.into();
        let call_id = call_id.into();
        Self {
            call_id,
            content: text.clone(),
            parts: vec![ToolOutputPart::Text(text)],
            is_error: false,
        }
    }

    /// Error result containing a plain-text error message.
    pub fn err(call_id: impl Into<String>, msg: impl Into<String>) -> Self {
        let text = msg.into();
        let call_id = call_id.into();
        Self {
            call_id,
            content: text.clone(),
            parts: vec![ToolOutputPart::Text(text)],
            is_error: true,
        }
    }

    /// Result with arbitrary parts (text and/or images).
    ///
    /// `content` is set to the concatenation of all Text parts.
    pub fn with_parts(call_id: impl Into<String>, parts: Vec<ToolOutputPart>) -> Self {
        let text = parts
            .iter()
            .filter_map(|p| match p {
                ToolOutputPart::Text(t) => Some(t.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n");
        Self {
            call_id: call_id.into(),
            content: text,
            parts,
            is_error: false,
        }
    }

    /// Truncate stdout/stderr-shaped content to `limit` characters, leaving a
    /// "truncated" marker, per the dispatcher's crash-handling contract.
    pub fn truncated(call_id: impl Into<String>, msg: impl Into<String>, limit: usize) -> Self {
        let mut text = msg.into();
        if text.len() > limit {
            text.truncate(limit);
            text.push_str("\n...[truncated]");
        }
        Self::err(call_id, text)
    }

    pub fn has_images(&self) -> bool {
        self.parts
            .iter()
            .any(|p| matches!(p, ToolOutputPart::Image(_)))
    }
}

/// One element of a tool's lazy invocation sequence (§4.D/§4.F).
///
/// A capability's `invoke` yields zero or more `Progress` events followed by
/// exactly one `Result`; the dispatcher consumes the sequence and re-checks
/// cancellation between elements.
#[derive(Debug, Clone)]
pub enum ToolEvent {
    /// An opaque progress snapshot; never sent back to the model.
    Progress(String),
    /// The terminal element of the sequence.
    Result(ToolOutput),
}

/// Trait that every built-in and user-defined tool capability must implement.
///
/// Defaults model a read/write tool whose permission need tracks its
/// [`default_policy`](Tool::default_policy): tools that auto-approve are
/// treated as read-only and concurrency-safe; tools that ask are treated as
/// mutating, permissioned, and unsafe to run alongside other tools. Override
/// any of these where a tool's actual semantics differ from that default.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    /// Human description, shown to the model as the tool's prompt snippet.
    fn description(&self) -> &str;
    /// JSON Schema for this tool's input, validated structurally at dispatch.
    fn parameters_schema(&self) -> Value;
    /// Default approval level, consulted by the permission engine.
    fn default_policy(&self) -> ApprovalPolicy;

    /// True if invoking this tool never mutates state outside the process.
    fn is_read_only(&self) -> bool {
        self.default_policy() == ApprovalPolicy::Auto
    }

    /// True if this tool may be scheduled in the same group as other
    /// concurrency-safe tools. A tool for which this is false must never be
    /// scheduled alongside any other tool (§4.G invariant).
    fn is_concurrency_safe(&self) -> bool {
        self.is_read_only()
    }

    /// Whether this particular `input` requires a permission check at all.
    /// Most tools answer this statically from their default policy; a few
    /// (e.g. the shell tool) refine it per-input.
    fn needs_permissions(&self, _input: &Value) -> bool {
        self.default_policy() != ApprovalPolicy::Auto
    }

    /// Custom semantic validation beyond JSON-Schema structural checks.
    /// `Err` carries the denial reason surfaced as an error tool_result.
    fn validate_input(&self, _input: &Value) -> Result<(), String> {
        Ok(())
    }

    /// Render `input` into the permission-key text shown to the user and used
    /// to build allow-list keys (e.g. `Bash(<rendered>)`). Defaults to the
    /// tool's name; tools whose permission key depends on the input (shell,
    /// file writers) must override this.
    fn render_tool_use_message(&self, _input: &Value, _verbose: bool) -> String {
        self.name().to_string()
    }

    /// The path on disk this call would write to, if this tool edits files.
    /// Consulted by the permission engine's directory-scope re-check (§4.E
    /// step 10); tools that never write to disk leave this `None`.
    fn write_target(&self, _input: &Value) -> Option<PathBuf> {
        None
    }

    /// Execute the tool to completion, ignoring progress. Most tools only
    /// need to implement this; [`invoke`](Tool::invoke) wraps it by default.
    async fn execute(&self, call: &ToolCall) -> ToolOutput;

    /// Lazy invocation sequence consumed by the dispatcher. The default
    /// collapses to a single terminal `Result` produced by [`execute`](Tool::execute);
    /// tools that emit intermediate progress override this directly.
    async fn invoke(&self, call: &ToolCall) -> Vec<ToolEvent> {
        vec![ToolEvent::Result(self.execute(call).await)]
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
