// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Deterministic mock providers for tests — no network access required.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::stream;

use crate::cancel::Scope;
use crate::error::TransportError;
use crate::transport::{ChunkStream, ModelProvider};
use crate::types::{AssistantMessage, ChunkFunctionCall, ChunkPart, CompletionRequest, Message, ResponseChunk, Usage};

/// Echoes the last user message back as the assistant response.
#[derive(Default)]
pub struct MockProvider;

#[async_trait]
impl ModelProvider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }

    async fn generate(&self, req: CompletionRequest, _scope: &Scope) -> Result<AssistantMessage, TransportError> {
        let reply = last_user_text(&req).unwrap_or_else(|| "[no input]".into());
        Ok(AssistantMessage {
            content: vec![crate::types::AssistantBlock::Text { text: format!("MOCK: {reply}") }],
            usage: Some(Usage { input_tokens: 10, output_tokens: 10, ..Default::default() }),
            duration_ms: None,
            trace_id: None,
        })
    }

    async fn stream(&self, req: CompletionRequest, _scope: &Scope) -> Result<ChunkStream, TransportError> {
        let reply = last_user_text(&req).unwrap_or_else(|| "[no input]".into());
        let chunks = vec![Ok(ResponseChunk {
            role: Some("model".into()),
            parts: vec![ChunkPart::Text(format!("MOCK: {reply}"))],
            usage: Some(Usage { input_tokens: 10, output_tokens: 10, ..Default::default() }),
            trace_id: None,
            finish_reason: Some("STOP".into()),
        })];
        Ok(Box::pin(stream::iter(chunks)))
    }
}

fn last_user_text(req: &CompletionRequest) -> Option<String> {
    req.messages.iter().rev().find_map(|m| match m {
        Message::User(u) => u.as_text().map(str::to_string),
        _ => None,
    })
}

/// A pre-scripted mock provider. Each call to `stream` pops the next
/// response script from the front of the queue. This lets tests specify
/// exact chunk sequences — including tool calls — without network access.
pub struct ScriptedMockProvider {
    scripts: Arc<Mutex<Vec<Vec<ResponseChunk>>>>,
    name: String,
    /// The last `CompletionRequest` seen by this provider.
    pub last_request: Arc<Mutex<Option<CompletionRequest>>>,
}

impl ScriptedMockProvider {
    /// Build a provider from a list of response scripts. The outer `Vec` is
    /// the ordered list of calls; the inner `Vec` is the chunk sequence
    /// emitted for that call.
    pub fn new(scripts: Vec<Vec<ResponseChunk>>) -> Self {
        Self { scripts: Arc::new(Mutex::new(scripts)), name: "scripted-mock".into(), last_request: Arc::new(Mutex::new(None)) }
    }

    /// Convenience: provider that always returns a single text reply.
    pub fn always_text(reply: impl Into<String>) -> Self {
        Self::new(vec![vec![ResponseChunk {
            role: Some("model".into()),
            parts: vec![ChunkPart::Text(reply.into())],
            usage: Some(Usage { input_tokens: 5, output_tokens: 5, ..Default::default() }),
            trace_id: None,
            finish_reason: Some("STOP".into()),
        }]])
    }

    /// Convenience: provider that returns a tool call followed by a text reply.
    pub fn tool_then_text(
        tool_id: impl Into<String>,
        tool_name: impl Into<String>,
        args: serde_json::Value,
        final_text: impl Into<String>,
    ) -> Self {
        Self::new(vec![
            vec![ResponseChunk {
                role: Some("model".into()),
                parts: vec![ChunkPart::FunctionCall(ChunkFunctionCall {
                    id: Some(tool_id.into()),
                    name: tool_name.into(),
                    args,
                    thought_signature: None,
                })],
                usage: None,
                trace_id: None,
                finish_reason: Some("STOP".into()),
            }],
            vec![ResponseChunk {
                role: Some("model".into()),
                parts: vec![ChunkPart::Text(final_text.into())],
                usage: None,
                trace_id: None,
                finish_reason: Some("STOP".into()),
            }],
        ])
    }

    fn next_script(&self) -> Vec<ResponseChunk> {
        let mut scripts = self.scripts.lock().unwrap();
        if scripts.is_empty() {
            vec![ResponseChunk {
                role: Some("model".into()),
                parts: vec![ChunkPart::Text("[no more scripts]".into())],
                usage: None,
                trace_id: None,
                finish_reason: Some("STOP".into()),
            }]
        } else {
            scripts.remove(0)
        }
    }
}

#[async_trait]
impl ModelProvider for ScriptedMockProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn generate(&self, req: CompletionRequest, scope: &Scope) -> Result<AssistantMessage, TransportError> {
        let mut stream = self.stream(req, scope).await?;
        let mut agg = crate::aggregator::Aggregator::new();
        use futures::StreamExt;
        while let Some(chunk) = stream.next().await {
            agg.push(chunk?);
        }
        Ok(agg.finish())
    }

    async fn stream(&self, req: CompletionRequest, _scope: &Scope) -> Result<ChunkStream, TransportError> {
        *self.last_request.lock().unwrap() = Some(req);
        let chunks: Vec<Result<ResponseChunk, TransportError>> = self.next_script().into_iter().map(Ok).collect();
        Ok(Box::pin(stream::iter(chunks)))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
