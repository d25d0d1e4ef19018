// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Auto-compaction (§4.I).
//!
//! When a session crosses its configured token threshold, the query loop
//! rewrites history into a single compaction request, sends it to the
//! model, and replaces history with the resulting summary. The functions
//! here do the deterministic half of that (building the request, and the
//! no-model-call emergency fallback); the model round-trip itself is the
//! query loop's job, mediated by the [`HistoryCompactor`] seam so tests can
//! swap in a no-op.

use kestrel_config::CompactionStrategy;
use kestrel_model::{AssistantBlock, ContentBlock, Message};

// ─── Compaction prompts ───────────────────────────────────────────────────────

const SUMMARIZE_PROMPT: &str =
    "You are a context compaction assistant. Summarise the following conversation history \
     in a concise, information-dense way. Preserve all technical details, decisions, file \
     names, code snippets, and tool outputs that may be relevant to future work. \
     The summary will replace the original history to free up context space.";

const STRUCTURED_COMPACTION_PROMPT: &str = "\
You are a context compaction assistant for a software engineering agent. \
Produce a structured state checkpoint from the conversation history below. \
Use EXACTLY the following Markdown sections — do not add or remove sections. \
Be information-dense: preserve file paths, function names, error messages, \
code snippets, test names, and technical decisions verbatim where they matter.

## Active Task
Describe in 1-3 sentences what the agent is currently working on.

## Key Decisions & Rationale
List every significant technical decision made and why (bullet points). \
Include file or component names.

## Files & Artifacts
List every file that was read, modified, or created, with a brief note on what was done.

## Constraints & Requirements
List every requirement, constraint, or user preference that must be preserved.

## Pending Items
List every unfinished subtask or open question.

## Session Narrative
Write a dense technical summary (2-5 paragraphs) of what happened, \
capturing the essential flow of events, tool outputs, and reasoning. \
Focus on facts the agent will need to continue correctly.";

// ─── Public API ───────────────────────────────────────────────────────────────

/// Pluggable compaction strategy consumed by the query loop.
///
/// `messages` never carries a system message in this data model (the system
/// prompt travels out-of-band as `CompletionRequest::system_instruction`),
/// so unlike the teacher's version this seam never needs to thread one
/// through.
pub trait HistoryCompactor: Send + Sync {
    /// Rewrite `messages` in place into a single compaction request.
    /// Returns the message count before rewriting.
    fn compact(&self, messages: &mut Vec<Message>, strategy: &CompactionStrategy) -> usize;

    /// No-model-call fallback: drop all but the last `keep_n` messages.
    /// Returns the message count before rewriting.
    fn emergency(&self, messages: &mut Vec<Message>, keep_n: usize) -> usize;
}

/// The real strategy: builds the summarisation/structured-checkpoint prompt
/// described in SUMMARIZE_PROMPT / STRUCTURED_COMPACTION_PROMPT.
pub struct DefaultCompactor;

impl HistoryCompactor for DefaultCompactor {
    fn compact(&self, messages: &mut Vec<Message>, strategy: &CompactionStrategy) -> usize {
        compact_session_with_strategy(messages, strategy)
    }

    fn emergency(&self, messages: &mut Vec<Message>, keep_n: usize) -> usize {
        emergency_compact(messages, keep_n)
    }
}

/// Does nothing; used to disable compaction deterministically in tests.
pub struct NoopCompactor;

impl HistoryCompactor for NoopCompactor {
    fn compact(&self, _messages: &mut Vec<Message>, _strategy: &CompactionStrategy) -> usize {
        0
    }

    fn emergency(&self, _messages: &mut Vec<Message>, _keep_n: usize) -> usize {
        0
    }
}

/// Replace the conversation history with a single summarisation request
/// using the narrative strategy.
pub fn compact_session(messages: &mut Vec<Message>) -> usize {
    compact_session_with_strategy(messages, &CompactionStrategy::Narrative)
}

/// Strategy-aware compaction: restructures the message list so the model
/// will produce a summary (or structured checkpoint) on the next turn.
///
/// The caller is responsible for actually invoking the model and rebuilding
/// the session from the resulting summary text.
pub fn compact_session_with_strategy(messages: &mut Vec<Message>, strategy: &CompactionStrategy) -> usize {
    let before = messages.len();
    let prompt = match strategy {
        CompactionStrategy::Structured => STRUCTURED_COMPACTION_PROMPT,
        CompactionStrategy::Narrative => SUMMARIZE_PROMPT,
    };
    let history_text = serialize_history(messages);
    let summary_request = Message::user(format!("{prompt}\n\n---\n\n{history_text}"));
    messages.clear();
    messages.push(summary_request);
    before
}

/// Emergency fallback compaction used when the session is too large to fit
/// even a compaction prompt within the context window.
///
/// Drops all but the last `keep_n` messages and prepends a canned notice.
/// No model call is made — deterministic, always succeeds.
pub fn emergency_compact(messages: &mut Vec<Message>, keep_n: usize) -> usize {
    let before = messages.len();
    let keep = keep_n.min(messages.len());
    let preserved: Vec<Message> = messages[messages.len() - keep..].to_vec();
    let notice = Message::assistant(
        "[Context emergency-compacted: earlier history was dropped to prevent a \
         context-window overflow. The agent may lack full context for earlier \
         decisions. Proceed carefully and ask the user to re-provide any missing \
         requirements if needed.]",
    );
    messages.clear();
    messages.push(notice);
    messages.extend(preserved);
    before
}

// ─── Private helpers ──────────────────────────────────────────────────────────

/// Serialise a message list into plain text for inclusion in a compaction
/// prompt. Progress messages are never replayed to the model (§3 invariant
/// iii) and are skipped here too.
fn serialize_history(messages: &[Message]) -> String {
    messages
        .iter()
        .filter_map(|m| match m {
            Message::User(u) => Some(format!("User: {}", format_user_blocks(u))),
            Message::Assistant(a) => Some(format!("Assistant: {}", format_assistant_blocks(a))),
            Message::Progress(_) => None,
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn format_user_blocks(u: &kestrel_model::UserMessage) -> String {
    u.content
        .iter()
        .map(|b| match b {
            ContentBlock::Text { text } => text.clone(),
            ContentBlock::Image { .. } => "[image]".to_string(),
            ContentBlock::ToolResult { content, .. } => format!("[tool_result: {content}]"),
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn format_assistant_blocks(a: &kestrel_model::AssistantMessage) -> String {
    a.content
        .iter()
        .map(|b| match b {
            AssistantBlock::Text { text } => text.clone(),
            AssistantBlock::Image { .. } => "[image]".to_string(),
            AssistantBlock::ToolUse { name, input, .. } => format!("[tool_call: {name}({input})]"),
        })
        .collect::<Vec<_>>()
        .join(" ")
}

// ─── Unit tests ───────────────────────────────────────────────────────────────
