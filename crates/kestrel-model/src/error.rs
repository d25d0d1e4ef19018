// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Transport error taxonomy (§4.B, §7).

use thiserror::Error;

use crate::cancel::TimeoutReason;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("http {0}: {1}")]
    HttpStatus(u16, String),
    #[error("request timed out")]
    RequestTimeout,
    #[error("stream idle timeout")]
    StreamIdleTimeout,
    #[error("aborted")]
    Aborted,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("malformed response: {0}")]
    Malformed(String),
}

impl TransportError {
    pub fn from_timeout_reason(reason: TimeoutReason) -> Self {
        match reason {
            TimeoutReason::RequestTimeout => Self::RequestTimeout,
            TimeoutReason::StreamIdleTimeout => Self::StreamIdleTimeout,
        }
    }

    /// Retry policy lives with the caller (§4.B "Retry policy"), but the
    /// classification itself is a property of the error kind.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::HttpStatus(code, _) => *code == 408 || *code == 429 || *code >= 500,
            Self::RequestTimeout | Self::StreamIdleTimeout => true,
            Self::Transport(_) => true,
            Self::Aborted | Self::Malformed(_) => false,
        }
    }

    /// HTTP-408-equivalent status for error kinds synthesised from a timer
    /// rather than an actual HTTP response (§4.B error kinds).
    pub fn synthetic_status(&self) -> Option<u16> {
        match self {
            Self::RequestTimeout | Self::StreamIdleTimeout => Some(408),
            Self::HttpStatus(code, _) => Some(*code),
            _ => None,
        }
    }
}
