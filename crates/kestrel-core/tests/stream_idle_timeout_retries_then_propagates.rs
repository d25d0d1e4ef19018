//! Scenario: a stream that goes idle mid-response trips the idle timer,
//! which is retried like any other transient transport failure; once
//! retries are exhausted the turn fails with the stream-timeout error kind
//! rather than a generic abort.

mod support;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use kestrel_config::Config;
use kestrel_core::{AgentEvent, CoreError, NoopCompactor};
use kestrel_model::{ChunkPart, ChunkStream, CompletionRequest, ModelProvider, ResponseChunk, Scope};
use kestrel_model::types::AssistantMessage;
use kestrel_model::TransportError;

/// Always emits one text chunk, then hangs forever on every attempt — the
/// idle timer, not the model, is what ends each attempt.
struct HangsAfterFirstChunk {
    attempts: AtomicUsize,
}

#[async_trait]
impl ModelProvider for HangsAfterFirstChunk {
    fn name(&self) -> &str {
        "hangs-after-first-chunk"
    }

    async fn generate(&self, _req: CompletionRequest, _scope: &Scope) -> Result<AssistantMessage, TransportError> {
        unimplemented!("not exercised by this test")
    }

    async fn stream(&self, _req: CompletionRequest, _scope: &Scope) -> Result<ChunkStream, TransportError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let chunk = ResponseChunk {
            role: Some("model".into()),
            parts: vec![ChunkPart::Text("partial".into())],
            usage: None,
            trace_id: None,
            finish_reason: None,
        };
        let first = futures::stream::once(async move { Ok(chunk) });
        let never: futures::stream::Pending<Result<ResponseChunk, TransportError>> = futures::stream::pending();
        Ok(Box::pin(first.chain(never)))
    }
}

#[tokio::test]
async fn idle_timeout_is_retried_then_surfaces_as_timed_out_stream() {
    let mut config = Config::default();
    config.timeouts.idle_secs = 1;
    config.retry.max_attempts = 2;
    config.retry.base_delay_ms = 10;
    config.retry.jitter_cap_ms = 5;

    let provider = HangsAfterFirstChunk { attempts: AtomicUsize::new(0) };
    let mut agent = kestrel_core::Agent::new(
        kestrel_core::Session::new(100_000),
        support::registry(),
        Arc::new(provider),
        support::bypass_permissions(),
        kestrel_core::AgentRuntimeContext::default(),
        &config,
        Arc::new(NoopCompactor),
    );

    let mut events = Vec::new();
    let result = agent.submit("say something slowly", None, &mut |e| events.push(e)).await;

    assert!(matches!(result, Err(CoreError::TimedOutStream)), "got {result:?}");
    let partial_chunks = events.iter().filter(|e| matches!(e, AgentEvent::TextDelta(t) if t == "partial")).count();
    assert_eq!(partial_chunks, 2, "expected one partial chunk per retried attempt");
}
