// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Stream aggregator (component C, §4.C).
//!
//! Folds a sequence of [`ResponseChunk`]s into one [`AssistantMessage`]:
//!
//! 1. Thought parts accumulate into a running reasoning buffer, split on the
//!    first `**bold**` delimiter into `{subject, description}` and exposed
//!    separately from the final text (never replayed to the model).
//! 2. Text parts either delta-append or, when a chunk's text is a superset
//!    of what has already been seen (a snapshot-style provider), replace the
//!    running buffer instead of concatenating.
//! 3. Function-call fragments are deduplicated by id, falling back to name
//!    continuity when a provider omits ids on follow-up fragments for the
//!    same call.
//! 4. Usage and finish_reason are taken from the last chunk that reports
//!    them.
//! 5. A message with no blocks at all is replaced with a sentinel so the
//!    history never carries a truly empty assistant turn.

use crate::types::{AssistantBlock, AssistantMessage, ChunkFunctionCall, ChunkPart, ResponseChunk, StopReason, Usage};

const EMPTY_SENTINEL: &str = "(No content)";

#[derive(Debug, Clone, Default)]
pub struct Thought {
    pub subject: Option<String>,
    pub description: String,
}

impl Thought {
    fn from_buffer(buf: &str) -> Self {
        match buf.split_once("**").and_then(|(_, rest)| rest.split_once("**")) {
            Some((subject, description)) => {
                Thought { subject: Some(subject.trim().to_string()), description: description.trim().to_string() }
            }
            None => Thought { subject: None, description: buf.trim().to_string() },
        }
    }
}

#[derive(Default)]
struct PendingCall {
    id: Option<String>,
    name: String,
    args: serde_json::Value,
    thought_signature: Option<String>,
}

/// Accumulates chunks for one turn. Construct fresh per turn.
#[derive(Default)]
pub struct Aggregator {
    text: String,
    thought_buf: String,
    calls: Vec<PendingCall>,
    usage: Option<Usage>,
    trace_id: Option<String>,
    finish_reason: Option<String>,
}

impl Aggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: ResponseChunk) {
        if chunk.usage.is_some() {
            self.usage = chunk.usage;
        }
        if chunk.trace_id.is_some() {
            self.trace_id = chunk.trace_id;
        }
        if chunk.finish_reason.is_some() {
            self.finish_reason = chunk.finish_reason;
        }

        for part in chunk.parts {
            match part {
                ChunkPart::Text(t) => self.push_text(t),
                ChunkPart::Thought(Some(t)) => self.thought_buf.push_str(&t),
                ChunkPart::Thought(None) => {}
                ChunkPart::FunctionCall(fc) => self.push_call(fc),
            }
        }
    }

    /// Rule 2: snapshot-vs-delta detection. If the incoming text is a
    /// superset of the buffer seen so far (starts with it, or the buffer is
    /// a prefix of it), treat it as a full snapshot and replace; otherwise
    /// append as a delta.
    fn push_text(&mut self, t: String) {
        if t.starts_with(self.text.as_str()) && t.len() >= self.text.len() {
            self.text = t;
        } else {
            self.text.push_str(&t);
        }
    }

    fn push_call(&mut self, fc: ChunkFunctionCall) {
        if let Some(id) = &fc.id {
            if let Some(existing) = self.calls.iter_mut().find(|c| c.id.as_deref() == Some(id.as_str())) {
                merge_call(existing, fc);
                return;
            }
        } else if let Some(existing) = self.calls.last_mut().filter(|c| c.id.is_none() && c.name == fc.name) {
            merge_call(existing, fc);
            return;
        }
        self.calls.push(PendingCall { id: fc.id, name: fc.name, args: fc.args, thought_signature: fc.thought_signature });
    }

    pub fn thought(&self) -> Option<Thought> {
        if self.thought_buf.is_empty() {
            None
        } else {
            Some(Thought::from_buffer(&self.thought_buf))
        }
    }

    pub fn stop_reason(&self) -> Option<StopReason> {
        if !self.calls.is_empty() {
            Some(StopReason::ToolUse)
        } else if self.finish_reason.is_some() {
            Some(StopReason::StopSequence)
        } else {
            None
        }
    }

    /// Fold everything accumulated so far into a final [`AssistantMessage`]
    /// (rule 5: never produces a message with zero blocks).
    pub fn finish(self) -> AssistantMessage {
        let mut content = Vec::new();
        if !self.text.is_empty() {
            content.push(AssistantBlock::Text { text: self.text });
        }
        for call in self.calls {
            content.push(AssistantBlock::ToolUse {
                id: call.id.unwrap_or_else(|| call.name.clone()),
                name: call.name,
                input: call.args,
                thought_signature: call.thought_signature,
            });
        }
        if content.is_empty() {
            content.push(AssistantBlock::Text { text: EMPTY_SENTINEL.into() });
        }
        AssistantMessage { content, usage: self.usage, duration_ms: None, trace_id: self.trace_id }
    }
}

fn merge_call(existing: &mut PendingCall, fc: ChunkFunctionCall) {
    if existing.name.is_empty() {
        existing.name = fc.name;
    }
    merge_json(&mut existing.args, fc.args);
    if fc.thought_signature.is_some() {
        existing.thought_signature = fc.thought_signature;
    }
}

/// Deep-merges `incoming` into `target`: object fields fold together
/// recursively, new keys are added, and scalars/arrays from `incoming` win
/// over `target`'s on conflict. A `Null` `incoming` is a no-op so a
/// fragment that carries no args for this call doesn't erase earlier ones.
fn merge_json(target: &mut serde_json::Value, incoming: serde_json::Value) {
    if incoming.is_null() {
        return;
    }
    match (target, incoming) {
        (serde_json::Value::Object(existing_map), serde_json::Value::Object(incoming_map)) => {
            for (key, value) in incoming_map {
                merge_json(existing_map.entry(key).or_insert(serde_json::Value::Null), value);
            }
        }
        (target, incoming) => *target = incoming,
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn text_chunk(t: &str) -> ResponseChunk {
        ResponseChunk { role: None, parts: vec![ChunkPart::Text(t.into())], usage: None, trace_id: None, finish_reason: None }
    }

    #[test]
    fn delta_text_chunks_concatenate() {
        let mut agg = Aggregator::new();
        agg.push(text_chunk("hello "));
        agg.push(text_chunk("world"));
        assert_eq!(agg.finish().as_text(), "hello world");
    }

    #[test]
    fn snapshot_style_text_replaces_instead_of_appending() {
        let mut agg = Aggregator::new();
        agg.push(text_chunk("hel"));
        agg.push(text_chunk("hello"));
        agg.push(text_chunk("hello world"));
        assert_eq!(agg.finish().as_text(), "hello world");
    }

    #[test]
    fn empty_message_gets_sentinel() {
        let agg = Aggregator::new();
        assert_eq!(agg.finish().as_text(), EMPTY_SENTINEL);
    }

    #[test]
    fn function_call_fragments_dedup_by_id() {
        let mut agg = Aggregator::new();
        agg.push(ResponseChunk {
            role: None,
            parts: vec![ChunkPart::FunctionCall(ChunkFunctionCall {
                id: Some("c1".into()),
                name: "shell".into(),
                args: json!({}),
                thought_signature: None,
            })],
            usage: None,
            trace_id: None,
            finish_reason: None,
        });
        agg.push(ResponseChunk {
            role: None,
            parts: vec![ChunkPart::FunctionCall(ChunkFunctionCall {
                id: Some("c1".into()),
                name: "shell".into(),
                args: json!({"command": "ls"}),
                thought_signature: None,
            })],
            usage: None,
            trace_id: None,
            finish_reason: None,
        });
        let msg = agg.finish();
        assert_eq!(msg.tool_uses().count(), 1);
        assert!(msg.has_tool_use());
    }

    #[test]
    fn function_call_fragments_without_id_merge_by_name_continuity() {
        let mut agg = Aggregator::new();
        for args in [json!({}), json!({"command": "ls"})] {
            agg.push(ResponseChunk {
                role: None,
                parts: vec![ChunkPart::FunctionCall(ChunkFunctionCall { id: None, name: "shell".into(), args, thought_signature: None })],
                usage: None,
                trace_id: None,
                finish_reason: None,
            });
        }
        assert_eq!(agg.finish().tool_uses().count(), 1);
    }

    #[test]
    fn thought_parts_split_on_bold_delimiter() {
        let mut agg = Aggregator::new();
        agg.push(ResponseChunk {
            role: None,
            parts: vec![ChunkPart::Thought(Some("**Reading file**checking contents now".into()))],
            usage: None,
            trace_id: None,
            finish_reason: None,
        });
        let t = agg.thought().unwrap();
        assert_eq!(t.subject.as_deref(), Some("Reading file"));
        assert_eq!(t.description, "checking contents now");
    }

    #[test]
    fn thought_without_bold_delimiter_has_no_subject() {
        let mut agg = Aggregator::new();
        agg.push(ResponseChunk { role: None, parts: vec![ChunkPart::Thought(Some("just thinking".into()))], usage: None, trace_id: None, finish_reason: None });
        let t = agg.thought().unwrap();
        assert!(t.subject.is_none());
        assert_eq!(t.description, "just thinking");
    }

    #[test]
    fn stop_reason_is_tool_use_when_calls_present() {
        let mut agg = Aggregator::new();
        agg.push(ResponseChunk {
            role: None,
            parts: vec![ChunkPart::FunctionCall(ChunkFunctionCall { id: Some("c1".into()), name: "shell".into(), args: json!({}), thought_signature: None })],
            usage: None,
            trace_id: None,
            finish_reason: Some("STOP".into()),
        });
        assert_eq!(agg.stop_reason(), Some(StopReason::ToolUse));
    }

    #[test]
    fn stop_reason_is_stop_sequence_when_no_calls() {
        let mut agg = Aggregator::new();
        agg.push(ResponseChunk { role: None, parts: vec![ChunkPart::Text("done".into())], usage: None, trace_id: None, finish_reason: Some("STOP".into()) });
        assert_eq!(agg.stop_reason(), Some(StopReason::StopSequence));
    }

    #[test]
    fn last_usage_wins() {
        let mut agg = Aggregator::new();
        agg.push(ResponseChunk { role: None, parts: vec![], usage: Some(Usage { input_tokens: 10, ..Default::default() }), trace_id: None, finish_reason: None });
        agg.push(ResponseChunk { role: None, parts: vec![], usage: Some(Usage { input_tokens: 20, ..Default::default() }), trace_id: None, finish_reason: None });
        assert_eq!(agg.finish().usage.unwrap().input_tokens, 20);
    }
}
