// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT

/// A structured todo item managed by the todo_write tool.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct TodoItem {
    pub id: String,
    pub content: String,
    /// One of: "pending", "in_progress", "completed", "cancelled"
    pub status: String,
}

/// Side-channel effects emitted by tools to communicate state changes back to
/// the caller, independent of the tool_result text sent to the model and
/// distinct from the `ToolEvent` progress/result sequence a capability's
/// `invoke` yields.
#[derive(Debug, Clone)]
pub enum ToolSideEffect {
    TodoUpdate(Vec<TodoItem>),
}
