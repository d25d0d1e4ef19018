// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Agent query loop (§4.H).
//!
//! One `Agent` owns a [`Session`] and drives it turn by turn: auto-compact
//! check, build the effective tool set and system prompt, call the
//! transport (retried, streamed through an [`Aggregator`]), yield the
//! assistant message, dispatch any tool_use blocks through the planner and
//! dispatcher, reorder the results, fold them back into history, and
//! repeat. Termination conditions are exactly §4.H's: no tool_use, a
//! cancelled scope, or an unrecoverable transport error after retries.

use std::sync::Arc;

use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use kestrel_config::Config;
use kestrel_model::cancel::Scope;
use kestrel_model::retry::{cancellable_sleep, RetryConfig};
use kestrel_model::transport::{ChunkStream, ModelProvider};
use kestrel_model::{
    AssistantBlock, AssistantMessage, ChunkPart, CompletionRequest, ContentBlock, Message,
    ToolDeclaration, TransportError,
};
use kestrel_tools::tool::{ToolCall, ToolOutput};
use kestrel_tools::ToolRegistry;

use crate::compact::HistoryCompactor;
use crate::dispatcher::{DispatchOutcome, ToolDispatcher};
use crate::error::{CoreError, MAX_EMPTY_RESPONSE_RETRIES};
use crate::events::AgentEvent;
use crate::permission::PermissionEngine;
use crate::planner::{self, DispatchGroup};
use crate::prompts::{system_prompt, PromptContext};
use crate::runtime_context::AgentRuntimeContext;
use crate::session::Session;

/// Mirrors `kestrel_model::aggregator`'s private rule-5 sentinel. An
/// assistant message that is exactly this text with no tool_use is an
/// empty turn, eligible for the hint-and-retry path (§4.H step 4).
const EMPTY_RESPONSE_SENTINEL: &str = "(No content)";

/// Maximum autonomous tool-call round-trip count of messages before the
/// wrap-up turn fires; driven from [`kestrel_config::AgentConfig`].
pub struct Agent {
    session: Session,
    registry: Arc<ToolRegistry>,
    model: Arc<dyn ModelProvider>,
    dispatcher: ToolDispatcher,
    runtime: AgentRuntimeContext,
    agent_config: kestrel_config::AgentConfig,
    retry_config: RetryConfig,
    concurrency_cap: usize,
    request_timeout: std::time::Duration,
    idle_timeout: std::time::Duration,
    model_name: String,
    temperature: Option<f32>,
    max_output_tokens: Option<u32>,
    compactor: Arc<dyn HistoryCompactor>,
}

impl Agent {
    pub fn new(
        session: Session,
        registry: Arc<ToolRegistry>,
        model: Arc<dyn ModelProvider>,
        permissions: Arc<PermissionEngine>,
        runtime: AgentRuntimeContext,
        config: &Config,
        compactor: Arc<dyn HistoryCompactor>,
    ) -> Self {
        let dispatcher = ToolDispatcher::new(Arc::clone(&registry), permissions);
        Self {
            session,
            registry,
            model,
            dispatcher,
            runtime,
            agent_config: config.agent.clone(),
            retry_config: config.retry.to_transport(),
            concurrency_cap: config.concurrency.clamped_cap(),
            request_timeout: config.timeouts.request_timeout(),
            idle_timeout: config.timeouts.idle_timeout(),
            model_name: config.model.name.clone(),
            temperature: config.model.temperature,
            max_output_tokens: config.model.max_tokens,
            compactor,
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut Session {
        &mut self.session
    }

    pub fn set_model(&mut self, model: Arc<dyn ModelProvider>) {
        self.model = model;
    }

    /// Submit a new user turn and run the query loop to completion (§4.H).
    pub async fn submit(
        &mut self,
        text: impl Into<String>,
        upstream: Option<&CancellationToken>,
        on_event: &mut dyn FnMut(AgentEvent),
    ) -> Result<(), CoreError> {
        self.session.push(Message::user(text));
        self.run_loop(upstream, on_event).await
    }

    /// Run the loop against whatever history is already in the session —
    /// used after seeding a persisted transcript, or to resume after the
    /// caller replaced history itself.
    pub async fn run_loop(
        &mut self,
        upstream: Option<&CancellationToken>,
        on_event: &mut dyn FnMut(AgentEvent),
    ) -> Result<(), CoreError> {
        // No request deadline at this level: `scope` spans every round of
        // the turn and must only trip on a genuine upstream abort, never on
        // a single HTTP attempt's timer (each attempt gets its own child
        // scope with the request/idle deadlines — see `run_turn`).
        let scope = Scope::new(upstream, None);
        let mut round: u32 = 0;

        loop {
            if scope.is_cancelled() {
                on_event(AgentEvent::Aborted { partial_text: String::new() });
                return Err(CoreError::Cancelled);
            }
            round += 1;
            let wrap_up = round > self.agent_config.max_tool_rounds;

            self.maybe_compact(on_event);

            let assistant = match self.run_turn(&scope, wrap_up, on_event).await {
                Ok(a) => a,
                Err(CoreError::Cancelled) => {
                    on_event(AgentEvent::Aborted { partial_text: String::new() });
                    return Err(CoreError::Cancelled);
                }
                Err(e) => {
                    on_event(AgentEvent::Error(e.to_string()));
                    return Err(e);
                }
            };

            self.session.push(Message::Assistant(assistant.clone()));
            on_event(AgentEvent::TextComplete(assistant.as_text()));

            if wrap_up || !assistant.has_tool_use() {
                break;
            }

            let calls: Vec<ToolCall> = assistant
                .tool_uses()
                .filter_map(|b| match b {
                    AssistantBlock::ToolUse { id, name, input, .. } => {
                        Some(ToolCall { id: id.clone(), name: name.clone(), args: input.clone() })
                    }
                    _ => None,
                })
                .collect();

            let aborted = self.dispatch_tool_calls(&calls, &scope, on_event).await;
            if aborted {
                on_event(AgentEvent::Aborted { partial_text: assistant.as_text() });
                return Err(CoreError::Cancelled);
            }
        }

        on_event(AgentEvent::TurnComplete);
        Ok(())
    }

    /// §4.I auto-compact check: recalculates the approximate token count and,
    /// if it crosses the configured fraction of the context window, asks the
    /// compactor to rewrite history. Falls back to the no-model emergency
    /// path if even the compaction request itself would not fit.
    fn maybe_compact(&mut self, on_event: &mut dyn FnMut(AgentEvent)) {
        if !self.session.is_near_limit(self.agent_config.compaction_threshold) {
            return;
        }
        let tokens_before = self.session.token_count;
        self.compactor.compact(&mut self.session.messages, &self.agent_config.compaction_strategy);
        self.session.recalculate_tokens();
        if self.session.max_tokens > 0 && self.session.token_count >= self.session.max_tokens {
            self.compactor.emergency(&mut self.session.messages, self.agent_config.compaction_keep_recent);
            self.session.recalculate_tokens();
        }
        on_event(AgentEvent::ContextCompacted { tokens_before, tokens_after: self.session.token_count });
    }

    /// One complete model turn: build the request, call the transport
    /// (retried on transient errors), stream chunks through an aggregator,
    /// and apply the empty-content hint-and-retry path (§4.H step 4).
    async fn run_turn(
        &self,
        scope: &Scope,
        wrap_up: bool,
        on_event: &mut dyn FnMut(AgentEvent),
    ) -> Result<AssistantMessage, CoreError> {
        let model = Arc::clone(&self.model);
        let mut hint: Option<String> = None;
        let mut empty_attempts = 0u32;

        loop {
            let mut req = self.build_request(hint.as_deref());
            if wrap_up {
                req.tools.clear();
                req.messages.push(Message::user(
                    "You have reached the maximum number of autonomous tool-call rounds for \
                     this turn. Summarise your progress in plain text and stop calling tools.",
                ));
            }

            // Retries span both stream acquisition and aggregation: an idle
            // or request timeout that trips mid-stream is just as retryable
            // as a failure to open the connection in the first place (§7,
            // §8 scenario 5). Each attempt gets a fresh `Aggregator`, so a
            // retried attempt never mixes chunks across connections.
            // Inlined equivalent of `kestrel_model::retry::retry_with_backoff`:
            // that helper takes an `F: FnMut() -> Fut`, but the per-attempt
            // future here needs to borrow `on_event` (`&mut dyn FnMut`), and
            // a closure cannot hand out a fresh reborrow of its own captured
            // `&mut` to each call's returned future without the borrow
            // outliving the closure body. Same retry policy, loop written
            // out directly instead of through the generic helper.
            let mut attempt = 0u32;
            let mut assistant = loop {
                attempt += 1;
                if scope.is_cancelled() {
                    return Err(CoreError::from(TransportError::Aborted));
                }
                let req = req.clone();
                let model = Arc::clone(&model);
                // Fresh per-attempt scope: an idle or request timeout on one
                // attempt must not poison `scope`, which still has to serve
                // every later round and retry of this turn.
                let attempt_scope = Scope::new(Some(&scope.handle()), Some(self.request_timeout));
                let result: Result<AssistantMessage, TransportError> = async {
                    let stream: ChunkStream = model.stream(req, &attempt_scope).await?;
                    self.aggregate_stream(stream, &attempt_scope, &mut *on_event).await
                }
                .await;
                match result {
                    Ok(v) => break v,
                    Err(e) if !e.is_retryable() => return Err(CoreError::from(e)),
                    Err(e) if attempt >= self.retry_config.max_attempts => return Err(CoreError::from(e)),
                    Err(e) => {
                        warn!(attempt, max = self.retry_config.max_attempts, error = %e, "retrying after transport error");
                        let dur = self.retry_config.delay_for_attempt(attempt);
                        if cancellable_sleep(dur, scope).await {
                            return Err(CoreError::from(TransportError::Aborted));
                        }
                    }
                }
            };

            if !assistant.has_tool_use() {
                if let Some(inner) = extract_inline_think_block(&assistant.as_text()) {
                    on_event(AgentEvent::ThinkingComplete(inner));
                    assistant.content.clear();
                } else if text_contains_malformed_tool_call(&assistant.as_text()) {
                    warn!(text = %assistant.as_text(), "model emitted tool-call markup in plain text instead of a structured call");
                }
            }

            let is_empty = assistant.is_empty() || assistant.as_text() == EMPTY_RESPONSE_SENTINEL;
            if is_empty && !assistant.has_tool_use() && empty_attempts < MAX_EMPTY_RESPONSE_RETRIES {
                empty_attempts += 1;
                hint = Some(
                    "Your previous response had no text and no tool call. Respond with either \
                     a text answer or a tool call."
                        .to_string(),
                );
                continue;
            }

            if assistant.is_empty() {
                assistant.content.push(AssistantBlock::Text { text: EMPTY_RESPONSE_SENTINEL.into() });
            }
            return Ok(assistant);
        }
    }

    /// Drive one streamed turn through an [`Aggregator`], translating chunks
    /// into [`AgentEvent`]s as they arrive (§4.C, §5 "Suspension points").
    async fn aggregate_stream(
        &self,
        mut stream: ChunkStream,
        scope: &Scope,
        on_event: &mut dyn FnMut(AgentEvent),
    ) -> Result<AssistantMessage, TransportError> {
        let mut agg = kestrel_model::Aggregator::new();
        let mut idle = scope.start_idle_timer(self.idle_timeout);
        let cancel_handle = scope.handle();

        loop {
            tokio::select! {
                biased;
                _ = cancel_handle.cancelled() => {
                    return Err(match scope.reason() {
                        Some(reason) => TransportError::from_timeout_reason(reason),
                        None => TransportError::Aborted,
                    });
                }
                next = stream.next() => {
                    match next {
                        None => break,
                        Some(Err(e)) => return Err(e),
                        Some(Ok(chunk)) => {
                            idle.reset();
                            for part in &chunk.parts {
                                match part {
                                    ChunkPart::Text(t) => on_event(AgentEvent::TextDelta(t.clone())),
                                    ChunkPart::Thought(Some(t)) => on_event(AgentEvent::ThinkingDelta(t.clone())),
                                    ChunkPart::Thought(None) | ChunkPart::FunctionCall(_) => {}
                                }
                            }
                            if let Some(u) = &chunk.usage {
                                on_event(AgentEvent::TokenUsage {
                                    input: u.input_tokens,
                                    output: u.output_tokens,
                                    context_total: self.session.token_count,
                                    cache_read: u.cache_read_tokens,
                                    cache_write: u.cache_write_tokens,
                                });
                            }
                            agg.push(chunk);
                        }
                    }
                }
            }
        }

        if let Some(thought) = agg.thought() {
            let raw = match &thought.subject {
                Some(subject) => format!("**{subject}**{}", thought.description),
                None => thought.description.clone(),
            };
            on_event(AgentEvent::ThinkingComplete(strip_think_wrappers(raw)));
        }

        Ok(agg.finish())
    }

    /// Build the effective tool set, assemble the system prompt, and clone
    /// the session's model-visible messages (progress snapshots excluded,
    /// §3 invariant iii) into one request, injecting contextual reminders
    /// into the latest eligible user message (§4.H step 3).
    fn build_request(&self, extra_hint: Option<&str>) -> CompletionRequest {
        let names = self.registry.names();
        let effective = self.runtime.effective_tool_names(&names);
        let tools: Vec<ToolDeclaration> = self
            .registry
            .schemas()
            .into_iter()
            .filter(|s| effective.contains(&s.name))
            .map(|s| ToolDeclaration { name: s.name, description: s.description, parameters: s.parameters })
            .collect();

        let custom_prompt = self
            .runtime
            .system_prompt_override
            .as_deref()
            .or(self.agent_config.system_prompt.as_deref());
        let ctx = PromptContext {
            project_root: self.runtime.project_root.as_deref(),
            git_context: self.runtime.git_context_note.as_deref(),
            project_context_file: self.runtime.project_context_file.as_deref(),
            ci_context: self.runtime.ci_context_note.as_deref(),
            append: self.runtime.append_system_prompt.as_deref(),
        };
        let system = system_prompt(custom_prompt, ctx);

        let mut messages: Vec<Message> = self.session.messages.iter().filter(|m| !m.is_progress()).cloned().collect();
        self.inject_reminders(&mut messages);
        if let Some(hint) = extra_hint {
            messages.push(Message::user(hint.to_string()));
        }

        CompletionRequest {
            model: self.model_name.clone(),
            system_instruction: Some(system),
            messages,
            tools,
            temperature: self.temperature,
            max_output_tokens: self.max_output_tokens,
        }
    }

    fn inject_reminders(&self, messages: &mut [Message]) {
        if self.runtime.context_reminders.is_empty() {
            return;
        }
        let banner = self.runtime.context_reminders.join("\n");
        for m in messages.iter_mut().rev() {
            if let Message::User(u) = m {
                if !u.starts_with_tool_result() {
                    u.content.push(ContentBlock::text(format!("<system-reminder>\n{banner}\n</system-reminder>")));
                    return;
                }
            }
        }
    }

    /// Plan, dispatch and fold back every tool_use in `calls`. Returns
    /// `true` if the turn was aborted mid-dispatch (§4.H step 8).
    async fn dispatch_tool_calls(
        &mut self,
        calls: &[ToolCall],
        scope: &Scope,
        on_event: &mut dyn FnMut(AgentEvent),
    ) -> bool {
        let plan = planner::plan(calls.to_vec(), &self.registry, self.concurrency_cap);

        let mut results: Vec<(String, ToolOutput)> = Vec::with_capacity(calls.len());

        for call in &plan.gated_out {
            let out = ToolOutput::err(&call.id, "gated out: at most one concurrency-unsafe tool call may run per turn");
            on_event(AgentEvent::ToolCallFinished {
                call_id: out.call_id.clone(),
                tool_name: call.name.clone(),
                output: out.content.clone(),
                is_error: out.is_error,
            });
            results.push((call.id.clone(), out));
        }

        for group in &plan.groups {
            if scope.is_cancelled() {
                return true;
            }
            for call in &group.calls {
                on_event(AgentEvent::ToolCallStarted(call.clone()));
            }

            let outcomes = self.dispatch_group(group, scope).await;
            for (call, (outcome, progresses)) in group.calls.iter().zip(outcomes) {
                let siblings: Vec<String> =
                    group.calls.iter().map(|c| c.id.clone()).filter(|id| id != &call.id).collect();
                for snapshot in progresses {
                    self.session.push(Message::progress(&call.id, siblings.clone(), snapshot.clone()));
                    on_event(AgentEvent::ToolProgress { call_id: call.id.clone(), snapshot });
                }
                match outcome {
                    DispatchOutcome::Aborted => return true,
                    DispatchOutcome::Completed(out) => {
                        on_event(AgentEvent::ToolCallFinished {
                            call_id: out.call_id.clone(),
                            tool_name: call.name.clone(),
                            output: out.content.clone(),
                            is_error: out.is_error,
                        });
                        results.push((call.id.clone(), out));
                    }
                }
            }
        }

        let ordered = planner::reorder_to_match(calls, results);
        for out in ordered {
            self.session.push(Message::tool_result(&out.call_id, out.content, out.is_error));
        }

        false
    }

    /// Dispatch every call in `group` concurrently (a group with one call
    /// degenerates to running it alone). Each future collects its own
    /// progress snapshots so nothing needs shared mutable state across the
    /// concurrent futures (§4.G).
    async fn dispatch_group(&self, group: &DispatchGroup, scope: &Scope) -> Vec<(DispatchOutcome, Vec<String>)> {
        let futures = group.calls.iter().map(|call| {
            let dispatcher = &self.dispatcher;
            async move {
                let mut progresses = Vec::new();
                let outcome = dispatcher.dispatch(call, scope, |p| progresses.push(p)).await;
                (outcome, progresses)
            }
        });
        futures::future::join_all(futures).await
    }
}

// ─── Reusable text heuristics (ported from the teacher's query loop) ─────────

/// Strip `<think>` / `</think>` wrapper tags some model servers leave
/// un-stripped in the reasoning channel.
fn strip_think_wrappers(s: String) -> String {
    let trimmed = s.trim();
    let inner = trimmed.strip_prefix("<think>").unwrap_or(trimmed);
    let inner = inner.strip_suffix("</think>").unwrap_or(inner);
    inner.trim().to_string()
}

/// Detect a `<think>...</think>` block occupying the *entire* text channel —
/// some models emit reasoning as plain text deltas with no dedicated
/// thinking part. Returns the extracted inner text so the caller can
/// reclassify the turn as thinking-only instead of a real answer.
fn extract_inline_think_block(text: &str) -> Option<String> {
    let trimmed = text.trim();
    let inner = trimmed.strip_prefix("<think>")?;
    let inner = inner.strip_suffix("</think>").unwrap_or(inner);
    if inner.contains("</think>") {
        return None;
    }
    Some(inner.trim().to_string())
}

/// True when `text` contains tool-call markup a fine-tuned model fell back
/// to writing as plain text instead of a structured call (Qwen XML,
/// Hermes-style function tags, or a bracketed literal).
fn text_contains_malformed_tool_call(text: &str) -> bool {
    text.contains("<tool_call>") || text.contains("</tool_call>") || text.contains("<function=") || text.contains("[TOOL_CALL]")
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
