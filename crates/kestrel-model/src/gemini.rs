// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Gemini driver — native Generative Language API (component B).
//!
//! Uses the `generateContent` / `streamGenerateContent` endpoints. Supports
//! text, tool calls, and thinking deltas via `thought` parts (§6 "Wire
//! format").
//!
//! # Auth
//! API key via `?key=...` query param.
//!
//! # Endpoint pattern
//! `POST https://generativelanguage.googleapis.com/v1beta/models/{model}:streamGenerateContent?alt=sse`

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use tracing::debug;

use crate::cancel::Scope;
use crate::error::TransportError;
use crate::sanitize::sanitize_schema;
use crate::sse::{Frame, SseFramer};
use crate::strip_images::{model_supports_images, strip_images_if_unsupported};

/// A tripped scope's token fired; recover the specific timeout reason if
/// one was recorded, falling back to a plain abort (upstream cancellation).
fn scope_trip_error(scope: &Scope) -> TransportError {
    match scope.reason() {
        Some(reason) => TransportError::from_timeout_reason(reason),
        None => TransportError::Aborted,
    }
}
use crate::transport::{ChunkStream, ModelProvider};
use crate::types::{
    AssistantBlock, AssistantMessage, ChunkFunctionCall, ChunkPart, CompletionRequest, ContentBlock, Message,
    ResponseChunk, Usage,
};

pub struct GeminiProvider {
    api_key: String,
    base_url: String,
    client: reqwest::Client,
}

impl GeminiProvider {
    pub fn new(api_key: String, base_url: Option<String>, request_timeout: Duration) -> Self {
        Self {
            api_key,
            base_url: base_url.unwrap_or_else(|| "https://generativelanguage.googleapis.com".into()),
            client: reqwest::Client::builder().timeout(request_timeout).build().unwrap_or_default(),
        }
    }

    fn endpoint(&self, model: &str, streaming: bool) -> String {
        let method = if streaming { "streamGenerateContent?alt=sse" } else { "generateContent" };
        format!("{}/v1beta/models/{model}:{method}", self.base_url.trim_end_matches('/'))
    }

    fn build_body(&self, req: &CompletionRequest) -> Value {
        let messages = strip_images_if_unsupported(req.messages.clone(), model_supports_images(&req.model));

        let mut contents: Vec<Value> = Vec::new();
        let mut tool_use_name_map: HashMap<String, String> = HashMap::new();
        for m in &messages {
            if let Message::Assistant(a) = m {
                for b in &a.content {
                    if let AssistantBlock::ToolUse { id, name, .. } = b {
                        tool_use_name_map.insert(id.clone(), name.clone());
                    }
                }
            }
        }

        for m in &messages {
            match m {
                Message::User(u) => {
                    contents.push(json!({ "role": "user", "parts": user_content_to_parts(&u.content, &tool_use_name_map) }));
                }
                Message::Assistant(a) => {
                    contents.push(json!({ "role": "model", "parts": assistant_content_to_parts(&a.content) }));
                }
                Message::Progress(_) => {} // never replayed to the model (§3 invariant iii)
            }
        }

        let tools_section: Option<Value> = if req.tools.is_empty() {
            None
        } else {
            let function_declarations: Vec<Value> = req
                .tools
                .iter()
                .map(|t| json!({
                    "name": t.name,
                    "description": t.description,
                    "parameters": sanitize_schema(&t.parameters),
                }))
                .collect();
            Some(json!([{ "functionDeclarations": function_declarations }]))
        };

        let mut body = json!({
            "contents": contents,
            "generationConfig": {
                "maxOutputTokens": req.max_output_tokens.unwrap_or(8192),
                "temperature": req.temperature.unwrap_or(0.2),
            }
        });
        if let Some(sys) = &req.system_instruction {
            body["systemInstruction"] = json!({ "parts": [{ "text": sys }] });
        }
        if let Some(tools) = tools_section {
            body["tools"] = tools;
        }
        body
    }

    async fn post(&self, url: String, body: &Value) -> Result<reqwest::Response, TransportError> {
        let resp = self
            .client
            .post(&url)
            .query(&[("key", self.api_key.as_str())])
            .json(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    TransportError::RequestTimeout
                } else {
                    TransportError::Transport(e.to_string())
                }
            })?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let text = resp.text().await.unwrap_or_default();
            return Err(TransportError::HttpStatus(status, text));
        }
        Ok(resp)
    }
}

#[async_trait]
impl ModelProvider for GeminiProvider {
    fn name(&self) -> &str {
        "gemini"
    }

    async fn generate(&self, req: CompletionRequest, scope: &Scope) -> Result<AssistantMessage, TransportError> {
        let body = self.build_body(&req);
        let url = self.endpoint(&req.model, false);
        debug!(model = %req.model, "sending Gemini generateContent request");

        let cancel_handle = scope.handle();
        let resp = tokio::select! {
            biased;
            _ = cancel_handle.cancelled() => return Err(scope_trip_error(scope)),
            r = self.post(url, &body) => r?,
        };
        let v: Value = resp.json().await.map_err(|e| TransportError::Malformed(e.to_string()))?;
        chunk_to_assistant_message(parse_gemini_value(&v)?)
    }

    async fn stream(&self, req: CompletionRequest, scope: &Scope) -> Result<ChunkStream, TransportError> {
        let body = self.build_body(&req);
        let url = self.endpoint(&req.model, true);
        debug!(model = %req.model, "sending Gemini streamGenerateContent request");

        let cancel_handle = scope.handle();
        let resp = tokio::select! {
            biased;
            _ = cancel_handle.cancelled() => return Err(scope_trip_error(scope)),
            r = self.post(url, &body) => r?,
        };

        let byte_stream = resp.bytes_stream();
        let mut framer = SseFramer::new();
        let chunk_stream = byte_stream.flat_map(move |chunk| {
            let mut out: Vec<Result<ResponseChunk, TransportError>> = Vec::new();
            match chunk {
                Ok(bytes) => {
                    for frame in framer.feed(&bytes) {
                        push_frame(frame, &mut out);
                    }
                }
                Err(e) => out.push(Err(TransportError::Transport(e.to_string()))),
            }
            futures::stream::iter(out)
        });

        Ok(Box::pin(chunk_stream))
    }
}

fn push_frame(frame: Frame, out: &mut Vec<Result<ResponseChunk, TransportError>>) {
    match frame {
        Frame::Skip => {}
        Frame::Payload(payload) => match serde_json::from_str::<Value>(&payload) {
            Ok(v) => match parse_gemini_value(&v) {
                Ok(chunk) => out.push(Ok(chunk)),
                Err(e) => out.push(Err(e)),
            },
            Err(e) => out.push(Err(TransportError::Malformed(e.to_string()))),
        },
    }
}

fn user_content_to_parts(content: &[ContentBlock], tool_use_name_map: &HashMap<String, String>) -> Vec<Value> {
    if content.is_empty() {
        return vec![json!({ "text": "" })];
    }
    content
        .iter()
        .map(|b| match b {
            ContentBlock::Text { text } => json!({ "text": text }),
            ContentBlock::Image { image_url, .. } => match parse_data_url(image_url) {
                Some((mime, data)) => json!({ "inline_data": { "mime_type": mime, "data": data } }),
                None => json!({ "file_data": { "file_uri": image_url } }),
            },
            ContentBlock::ToolResult { tool_use_id, content, is_error } => {
                let name = tool_use_name_map.get(tool_use_id).map(String::as_str).unwrap_or(tool_use_id);
                let output = if *is_error { format!("error: {content}") } else { content.clone() };
                json!({ "functionResponse": { "name": name, "response": { "output": output } } })
            }
        })
        .collect()
}

fn assistant_content_to_parts(content: &[AssistantBlock]) -> Vec<Value> {
    if content.is_empty() {
        return vec![json!({ "text": "" })];
    }
    content
        .iter()
        .map(|b| match b {
            AssistantBlock::Text { text } => json!({ "text": text }),
            AssistantBlock::Image { image_url, .. } => match parse_data_url(image_url) {
                Some((mime, data)) => json!({ "inline_data": { "mime_type": mime, "data": data } }),
                None => json!({ "file_data": { "file_uri": image_url } }),
            },
            AssistantBlock::ToolUse { name, input, thought_signature, .. } => {
                let mut part = json!({ "functionCall": { "name": name, "args": input } });
                if let Some(sig) = thought_signature {
                    part["thoughtSignature"] = json!(sig);
                }
                part
            }
        })
        .collect()
}

fn parse_data_url(url: &str) -> Option<(String, String)> {
    let rest = url.strip_prefix("data:")?;
    let (meta, data) = rest.split_once(";base64,")?;
    Some((meta.to_string(), data.to_string()))
}

/// Parse one streamed payload or the single non-streaming response body into
/// a [`ResponseChunk`] (§4.B "chunk parsing rule", §4.C thought/function-call
/// shape).
fn parse_gemini_value(v: &Value) -> Result<ResponseChunk, TransportError> {
    let usage = v.get("usageMetadata").map(|meta| Usage {
        input_tokens: meta["promptTokenCount"].as_u64().unwrap_or(0) as u32,
        output_tokens: meta["candidatesTokenCount"].as_u64().unwrap_or(0) as u32,
        cache_read_tokens: meta["cachedContentTokenCount"].as_u64().unwrap_or(0) as u32,
        cache_write_tokens: 0,
    });

    let candidate = &v["candidates"][0];
    let finish_reason = candidate["finishReason"].as_str().map(str::to_string);

    let mut parts = Vec::new();
    if let Some(raw_parts) = candidate["content"]["parts"].as_array() {
        for part in raw_parts {
            if let Some(fc) = part.get("functionCall") {
                parts.push(ChunkPart::FunctionCall(ChunkFunctionCall {
                    id: fc.get("id").and_then(Value::as_str).map(str::to_string),
                    name: fc["name"].as_str().unwrap_or_default().to_string(),
                    args: fc["args"].clone(),
                    thought_signature: part.get("thoughtSignature").and_then(Value::as_str).map(str::to_string),
                }));
                continue;
            }
            let is_thought = part.get("thought").and_then(Value::as_bool) == Some(true);
            if let Some(text) = part["text"].as_str() {
                if is_thought {
                    parts.push(ChunkPart::Thought(Some(text.to_string())));
                } else {
                    parts.push(ChunkPart::Text(text.to_string()));
                }
            } else if is_thought {
                parts.push(ChunkPart::Thought(None));
            }
        }
    }

    Ok(ResponseChunk { role: Some("model".into()), parts, usage, trace_id: None, finish_reason })
}

fn chunk_to_assistant_message(chunk: ResponseChunk) -> Result<AssistantMessage, TransportError> {
    let content = chunk
        .parts
        .into_iter()
        .filter_map(|p| match p {
            ChunkPart::Text(text) => Some(AssistantBlock::Text { text }),
            ChunkPart::FunctionCall(fc) => Some(AssistantBlock::ToolUse {
                id: fc.id.unwrap_or_else(|| fc.name.clone()),
                name: fc.name,
                input: fc.args,
                thought_signature: fc.thought_signature,
            }),
            ChunkPart::Thought(_) => None,
        })
        .collect();
    Ok(AssistantMessage { content, usage: chunk.usage, duration_ms: None, trace_id: chunk.trace_id })
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_parsed_from_metadata() {
        let v = json!({ "usageMetadata": { "promptTokenCount": 100, "candidatesTokenCount": 50 } });
        let chunk = parse_gemini_value(&v).unwrap();
        assert_eq!(chunk.usage.unwrap().input_tokens, 100);
    }

    #[test]
    fn text_part_parsed() {
        let v = json!({ "candidates": [{ "content": { "parts": [{ "text": "hello" }] } }] });
        let chunk = parse_gemini_value(&v).unwrap();
        assert!(matches!(&chunk.parts[0], ChunkPart::Text(t) if t == "hello"));
    }

    #[test]
    fn thought_part_parsed_separately_from_text() {
        let v = json!({ "candidates": [{ "content": { "parts": [{ "text": "thinking...", "thought": true }] } }] });
        let chunk = parse_gemini_value(&v).unwrap();
        assert!(matches!(&chunk.parts[0], ChunkPart::Thought(Some(t)) if t == "thinking..."));
    }

    #[test]
    fn function_call_part_parsed() {
        let v = json!({
            "candidates": [{ "content": { "parts": [{ "functionCall": { "name": "shell", "args": { "command": "ls" } } }] } }]
        });
        let chunk = parse_gemini_value(&v).unwrap();
        match &chunk.parts[0] {
            ChunkPart::FunctionCall(fc) => assert_eq!(fc.name, "shell"),
            other => panic!("expected FunctionCall, got {other:?}"),
        }
    }

    #[test]
    fn finish_reason_surfaced_without_parts() {
        let v = json!({ "candidates": [{ "content": {}, "finishReason": "STOP" }] });
        let chunk = parse_gemini_value(&v).unwrap();
        assert_eq!(chunk.finish_reason.as_deref(), Some("STOP"));
        assert!(chunk.parts.is_empty());
    }

    #[test]
    fn tool_result_uses_function_name_not_opaque_id() {
        let mut map = HashMap::new();
        map.insert("call_opaque_123".to_string(), "read_file".to_string());
        let content = vec![ContentBlock::tool_result("call_opaque_123", "contents", false)];
        let parts = user_content_to_parts(&content, &map);
        assert_eq!(parts[0]["functionResponse"]["name"], "read_file");
    }

    #[test]
    fn tool_result_falls_back_to_id_when_unmapped() {
        let content = vec![ContentBlock::tool_result("unmapped_id", "result", false)];
        let parts = user_content_to_parts(&content, &HashMap::new());
        assert_eq!(parts[0]["functionResponse"]["name"], "unmapped_id");
    }

    #[test]
    fn image_content_block_serialised_as_inline_data() {
        let content = vec![ContentBlock::text("look"), ContentBlock::image("data:image/png;base64,abc=")];
        let parts = user_content_to_parts(&content, &HashMap::new());
        assert_eq!(parts[0]["text"], "look");
        assert_eq!(parts[1]["inline_data"]["mime_type"], "image/png");
        assert_eq!(parts[1]["inline_data"]["data"], "abc=");
    }

    #[test]
    fn tool_use_assistant_block_carries_thought_signature() {
        let content = vec![AssistantBlock::ToolUse {
            id: "t1".into(),
            name: "shell".into(),
            input: json!({"command": "ls"}),
            thought_signature: Some("sig123".into()),
        }];
        let parts = assistant_content_to_parts(&content);
        assert_eq!(parts[0]["thoughtSignature"], "sig123");
    }

    #[test]
    fn chunk_to_assistant_message_drops_thought_parts() {
        let chunk = ResponseChunk {
            role: None,
            parts: vec![ChunkPart::Thought(Some("hmm".into())), ChunkPart::Text("answer".into())],
            usage: None,
            trace_id: None,
            finish_reason: None,
        };
        let msg = chunk_to_assistant_message(chunk).unwrap();
        assert_eq!(msg.as_text(), "answer");
    }

    fn provider() -> GeminiProvider {
        GeminiProvider::new("key".into(), None, Duration::from_secs(30))
    }

    fn request_with_image(model: &str) -> CompletionRequest {
        CompletionRequest {
            model: model.into(),
            system_instruction: None,
            messages: vec![Message::User(crate::types::UserMessage {
                content: vec![ContentBlock::text("look"), ContentBlock::image("data:image/png;base64,abc=")],
            })],
            tools: vec![],
            temperature: None,
            max_output_tokens: None,
        }
    }

    #[test]
    fn build_body_keeps_images_for_multimodal_model() {
        let body = provider().build_body(&request_with_image("gemini-2.0-flash"));
        let parts = &body["contents"][0]["parts"];
        assert!(parts.as_array().unwrap().iter().any(|p| p.get("inline_data").is_some()));
    }

    #[test]
    fn build_body_strips_images_for_nano_model() {
        let body = provider().build_body(&request_with_image("gemini-nano-2"));
        let parts = &body["contents"][0]["parts"];
        assert!(parts.as_array().unwrap().iter().all(|p| p.get("inline_data").is_none()));
        assert!(parts[1]["text"].as_str().unwrap().contains("omitted"));
    }
}
