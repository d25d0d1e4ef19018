// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Tool dispatcher (§4.F).
//!
//! Takes one `tool_use` block through lookup, schema validation, semantic
//! validation, permission check, and the lazy invoke sequence, collapsing
//! whatever happens — success, validation failure, denial, abort, or a
//! panicking tool — into exactly one [`DispatchOutcome`] plus zero or more
//! progress snapshots surfaced along the way.

use std::sync::Arc;

use kestrel_model::cancel::Scope;
use kestrel_tools::tool::{ToolCall, ToolEvent, ToolOutput};
use kestrel_tools::ToolRegistry;

use crate::error::TOOL_CRASH_TRUNCATE_LIMIT;
use crate::permission::{PermissionDecision, PermissionEngine};

/// The result of dispatching one tool_use.
#[derive(Debug, Clone)]
pub enum DispatchOutcome {
    /// The tool ran (successfully or not — `ToolOutput::is_error` distinguishes).
    Completed(ToolOutput),
    /// The turn was cancelled before or during dispatch; no tool_result
    /// should be synthesized — the caller's abort handling takes over.
    Aborted,
}

pub struct ToolDispatcher {
    registry: Arc<ToolRegistry>,
    permissions: Arc<PermissionEngine>,
}

impl ToolDispatcher {
    pub fn new(registry: Arc<ToolRegistry>, permissions: Arc<PermissionEngine>) -> Self {
        Self { registry, permissions }
    }

    /// Dispatch one call. `on_progress` is invoked for each intermediate
    /// [`ToolEvent::Progress`] snapshot a tool's invocation sequence yields,
    /// in order, before the terminal outcome is returned.
    pub async fn dispatch(&self, call: &ToolCall, scope: &Scope, mut on_progress: impl FnMut(String)) -> DispatchOutcome {
        if scope.is_cancelled() {
            return DispatchOutcome::Aborted;
        }

        let Some(tool) = self.registry.get(&call.name) else {
            return DispatchOutcome::Completed(ToolOutput::err(&call.id, format!("Error: No such tool available: {}", call.name)));
        };

        if let Err(msg) = self.registry.validate_schema(&call.name, &call.args) {
            return DispatchOutcome::Completed(ToolOutput::err(&call.id, format!("invalid input: {msg}")));
        }

        if let Err(msg) = tool.validate_input(&call.args) {
            return DispatchOutcome::Completed(ToolOutput::err(&call.id, msg));
        }

        let command = if call.name == "shell" {
            call.args.get("shell_command").and_then(|v| v.as_str()).unwrap_or("").to_string()
        } else {
            String::new()
        };

        match self.permissions.decide(tool.as_ref(), &call.args, &command, scope).await {
            PermissionDecision::Abort => return DispatchOutcome::Aborted,
            PermissionDecision::Deny(reason) => {
                return DispatchOutcome::Completed(ToolOutput::err(&call.id, format!("permission denied: {reason}")));
            }
            PermissionDecision::Allow => {}
        }

        if scope.is_cancelled() {
            return DispatchOutcome::Aborted;
        }

        let call_owned = call.clone();
        let handle = tokio::spawn(async move { tool.invoke(&call_owned).await });

        let events = match handle.await {
            Ok(events) => events,
            Err(join_err) => {
                return DispatchOutcome::Completed(ToolOutput::truncated(
                    &call.id,
                    format!("tool panicked: {join_err}"),
                    TOOL_CRASH_TRUNCATE_LIMIT,
                ));
            }
        };

        for event in events {
            if scope.is_cancelled() {
                return DispatchOutcome::Aborted;
            }
            match event {
                ToolEvent::Progress(snapshot) => on_progress(snapshot),
                ToolEvent::Result(mut out) => {
                    if out.content.len() > TOOL_CRASH_TRUNCATE_LIMIT {
                        out = ToolOutput::truncated(&out.call_id, out.content, TOOL_CRASH_TRUNCATE_LIMIT);
                    }
                    return DispatchOutcome::Completed(out);
                }
            }
        }

        DispatchOutcome::Completed(ToolOutput::err(&call.id, "tool produced no result"))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
