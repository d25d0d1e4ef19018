// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Core-level error taxonomy (§7).
//!
//! Transport failures already carry their own fine-grained shape
//! ([`kestrel_model::TransportError`]); this enum wraps that plus the
//! failure modes that only exist once a tool, a permission decision, or the
//! loop's own guards enter the picture.

use kestrel_model::TransportError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    /// The caller's cancellation token fired; the turn was aborted, not failed.
    #[error("cancelled")]
    Cancelled,
    /// The whole request deadline elapsed.
    #[error("request timed out")]
    TimedOutRequest,
    /// The stream produced no bytes for longer than the configured idle window.
    #[error("stream went idle")]
    TimedOutStream,
    /// A transport error the caller may retry (429/5xx/network blip).
    #[error("retryable transport error: {0}")]
    HttpRetryable(String),
    /// A transport error that retrying will not fix (4xx other than 408/429).
    #[error("non-retryable transport error: {0}")]
    HttpNonRetryable(String),
    /// Tool input failed schema or semantic validation.
    #[error("validation failed: {0}")]
    ValidationFailed(String),
    /// The permission engine refused the call.
    #[error("permission denied: {0}")]
    ToolDenied(String),
    /// The tool panicked or its future was aborted mid-flight; `message` has
    /// already been truncated to the crash-collapse limit.
    #[error("tool crashed: {0}")]
    ToolCrashed(String),
    /// The model returned an assistant message with no content and no tool
    /// calls after all automatic retries were exhausted.
    #[error("empty response after retries")]
    EmptyResponse,
}

/// Tool output text is collapsed to this many characters before being
/// wrapped in [`CoreError::ToolCrashed`] (§7).
pub const TOOL_CRASH_TRUNCATE_LIMIT: usize = 10_000;

/// Up to this many consecutive empty-response retries are attempted before
/// giving up with [`CoreError::EmptyResponse`] (§7).
pub const MAX_EMPTY_RESPONSE_RETRIES: u32 = 2;

impl From<TransportError> for CoreError {
    fn from(e: TransportError) -> Self {
        match &e {
            TransportError::Aborted => CoreError::Cancelled,
            TransportError::RequestTimeout => CoreError::TimedOutRequest,
            TransportError::StreamIdleTimeout => CoreError::TimedOutStream,
            _ if e.is_retryable() => CoreError::HttpRetryable(e.to_string()),
            _ => CoreError::HttpNonRetryable(e.to_string()),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
