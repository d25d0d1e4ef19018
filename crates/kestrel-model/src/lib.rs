// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Cancellation, transport, and stream aggregation — components A, B and C.

pub mod aggregator;
pub mod cancel;
pub mod error;
pub mod gemini;
pub mod mock;
pub mod retry;
pub mod sanitize;
pub mod sse;
pub mod strip_images;
pub mod transport;
pub mod types;

pub use aggregator::Aggregator;
pub use cancel::{IdleTimer, Scope, TimeoutReason};
pub use error::TransportError;
pub use gemini::GeminiProvider;
pub use mock::{MockProvider, ScriptedMockProvider};
pub use retry::{cancellable_sleep, retry_with_backoff, RetryConfig};
pub use transport::{ChunkStream, ModelProvider};
pub use types::*;
