// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Model transport trait (component B).

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use crate::cancel::Scope;
use crate::error::TransportError;
use crate::types::{AssistantMessage, CompletionRequest, ResponseChunk};

pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<ResponseChunk, TransportError>> + Send>>;

/// Issues non-streaming and SSE streaming requests to a model provider.
///
/// Implementations own HTTP transport concerns (auth headers, endpoint
/// shape); retry and aggregation are layered on top by the caller (§4.B,
/// §4.C) so that a provider driver stays a thin, testable translation layer.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Single-shot JSON round trip.
    async fn generate(&self, req: CompletionRequest, scope: &Scope) -> Result<AssistantMessage, TransportError>;

    /// POST that returns either SSE or a fallback one-shot body; yields
    /// parsed chunks as they arrive.
    async fn stream(&self, req: CompletionRequest, scope: &Scope) -> Result<ChunkStream, TransportError>;
}
