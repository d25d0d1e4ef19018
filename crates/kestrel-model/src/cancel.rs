// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Cancellation & deadline primitive (component A).
//!
//! Unifies user abort, a per-request timeout and a per-stream idle timeout
//! into one cancellable [`Scope`] with a single `reason` tag. At most one
//! reason is ever recorded — first writer wins — so observers downstream
//! (the transport, the dispatcher) can translate "why did this trip" into
//! the right error kind without racing each other.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// Why a [`Scope`] tripped. `None` (the implicit default) means the upstream
/// caller aborted directly — upstream always wins over a timer that happens
/// to fire around the same time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutReason {
    RequestTimeout,
    StreamIdleTimeout,
}

/// A first-writer-wins cell: the first `set` call sticks, every later call
/// is a no-op. Used for the scope's `reason` field.
#[derive(Debug)]
struct FirstWriterWins<T> {
    cell: OnceLock<T>,
}

impl<T> Default for FirstWriterWins<T> {
    fn default() -> Self {
        Self {
            cell: OnceLock::new(),
        }
    }
}

impl<T> FirstWriterWins<T> {
    fn set(&self, value: T) -> bool {
        self.cell.set(value).is_ok()
    }

    fn get(&self) -> Option<&T> {
        self.cell.get()
    }
}

/// Shared cancellation scope for one user request.
///
/// Cloning a `Scope` shares the same underlying token and reason cell — it
/// is the handle every task in the request holds, not a fresh scope.
#[derive(Clone)]
pub struct Scope {
    token: CancellationToken,
    reason: Arc<FirstWriterWins<TimeoutReason>>,
    tripped_logged: Arc<AtomicBool>,
    request_timer: Arc<std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>>,
}

impl Scope {
    /// Create a new scope, optionally as a child of an `upstream` token
    /// (e.g. a process-wide shutdown signal or the caller's own abort
    /// handle) and optionally with a request-level deadline.
    ///
    /// If `upstream` fires, this scope trips with `reason = None` (upstream
    /// wins — see module docs). If `request_timeout` elapses first, the
    /// scope marks `RequestTimeout` then trips.
    pub fn new(upstream: Option<&CancellationToken>, request_timeout: Option<Duration>) -> Self {
        let token = match upstream {
            Some(parent) => parent.child_token(),
            None => CancellationToken::new(),
        };
        let scope = Self {
            token,
            reason: Arc::new(FirstWriterWins::default()),
            tripped_logged: Arc::new(AtomicBool::new(false)),
            request_timer: Arc::new(std::sync::Mutex::new(None)),
        };
        if let Some(dur) = request_timeout {
            scope.start_request_timer(dur);
        }
        scope
    }

    fn start_request_timer(&self, dur: Duration) {
        let this = self.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(dur).await;
            this.mark(TimeoutReason::RequestTimeout);
        });
        *self.request_timer.lock().unwrap() = Some(handle);
    }

    /// The underlying cancellation handle, clonable and observable from any
    /// task via `.cancelled().await` or `.is_cancelled()`.
    pub fn handle(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Latch `reason` (only if nothing has been recorded yet) and trip the
    /// token. Safe to call from multiple tasks/timers concurrently.
    pub fn mark(&self, reason: TimeoutReason) {
        let first = self.reason.set(reason);
        if first && !self.tripped_logged.swap(true, Ordering::SeqCst) {
            tracing::info!(?reason, "cancellation scope tripped");
        }
        self.token.cancel();
    }

    /// Trip with no recorded reason — used for a direct user/upstream abort.
    pub fn abort(&self) {
        if !self.tripped_logged.swap(true, Ordering::SeqCst) {
            tracing::info!("cancellation scope tripped (upstream abort)");
        }
        self.token.cancel();
    }

    pub fn reason(&self) -> Option<TimeoutReason> {
        self.reason.get().copied()
    }

    /// Call once streaming framing is detected: the request-level timer no
    /// longer applies (an open SSE connection may legitimately run long),
    /// replaced by an idle timer the caller resets on every byte received.
    pub fn clear_request_timer(&self) {
        if let Some(handle) = self.request_timer.lock().unwrap().take() {
            handle.abort();
        }
    }

    /// Start (or restart) an idle timer: if no call to the returned
    /// [`IdleTimer::reset`] happens within `dur`, the scope marks
    /// `StreamIdleTimeout` and trips.
    pub fn start_idle_timer(&self, dur: Duration) -> IdleTimer {
        IdleTimer::new(self.clone(), dur)
    }

    /// Idempotent: unregisters the request timer and leaves the token as-is
    /// (child tokens unregister themselves from the parent on drop).
    pub fn close(&self) {
        self.clear_request_timer();
    }
}

/// Resettable idle timer backing `scope.start_idle_timer`. Each `reset`
/// cancels the previous pending tick and schedules a fresh one.
pub struct IdleTimer {
    scope: Scope,
    dur: Duration,
    current: Option<tokio::task::JoinHandle<()>>,
}

impl IdleTimer {
    fn new(scope: Scope, dur: Duration) -> Self {
        let mut timer = Self { scope, dur, current: None };
        timer.reset();
        timer
    }

    pub fn reset(&mut self) {
        if let Some(h) = self.current.take() {
            h.abort();
        }
        let scope = self.scope.clone();
        let dur = self.dur;
        self.current = Some(tokio::spawn(async move {
            tokio::time::sleep(dur).await;
            scope.mark(TimeoutReason::StreamIdleTimeout);
        }));
    }
}

impl Drop for IdleTimer {
    fn drop(&mut self) {
        if let Some(h) = self.current.take() {
            h.abort();
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
