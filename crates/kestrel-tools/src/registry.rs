// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::sync::Arc;

use jsonschema::JSONSchema;

use crate::{Tool, ToolCall, ToolEvent, ToolOutput};

/// A tool schema handed to the model transport as a tool declaration.
#[derive(Debug, Clone)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// A registered capability: the tool plus its schema, compiled once at
/// registration time (§4.D: "checked-once/applied-many-times").
struct Entry {
    tool: Arc<dyn Tool>,
    compiled_schema: Option<JSONSchema>,
}

/// Central registry holding all available tool capabilities.
pub struct ToolRegistry {
    tools: HashMap<String, Entry>,
}

// SAFETY: ToolRegistry is Sync because:
// - HashMap<String, Entry> is Sync (String is Sync, Arc<T: Send + Sync> is Sync,
//   and JSONSchema does not use interior mutability once compiled)
// - Tools implement Send + Sync (required by the Tool trait)
// - No interior mutability exists after construction (all methods take &self)
unsafe impl Sync for ToolRegistry {}

impl ToolRegistry {
    pub fn new() -> Self {
        Self { tools: HashMap::new() }
    }

    /// Register a tool, compiling its declared input schema once.
    ///
    /// A tool whose schema fails to compile is still registered (the
    /// dispatcher falls back to accepting any input for it) rather than
    /// panicking at process start — a malformed schema is a tool-authoring
    /// bug, not a reason to take the whole registry down.
    pub fn register(&mut self, tool: impl Tool + 'static) {
        let tool = Arc::new(tool);
        let compiled_schema = JSONSchema::compile(&tool.parameters_schema()).ok();
        self.tools
            .insert(tool.name().to_string(), Entry { tool, compiled_schema });
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).map(|e| e.tool.clone())
    }

    /// Structurally validate `input` against the tool's compiled schema.
    /// Returns `Ok(())` when the tool is unknown or has no compilable schema —
    /// the caller is expected to have already checked the tool exists.
    pub fn validate_schema(&self, name: &str, input: &serde_json::Value) -> Result<(), String> {
        let Some(entry) = self.tools.get(name) else {
            return Ok(());
        };
        let Some(schema) = &entry.compiled_schema else {
            return Ok(());
        };
        match schema.validate(input) {
            Ok(()) => Ok(()),
            Err(errors) => {
                let messages: Vec<String> = errors.map(|e| e.to_string()).collect();
                Err(messages.join("; "))
            }
        }
    }

    /// Produce schemas for all registered tools.
    pub fn schemas(&self) -> Vec<ToolSchema> {
        let mut schemas: Vec<ToolSchema> = self
            .tools
            .values()
            .map(|e| ToolSchema {
                name: e.tool.name().to_string(),
                description: e.tool.description().to_string(),
                parameters: e.tool.parameters_schema(),
            })
            .collect();
        schemas.sort_by(|a, b| a.name.cmp(&b.name));
        schemas
    }

    /// Execute a tool to completion, collapsing its lazy sequence to the
    /// final result (progress events are consumed and discarded).
    pub async fn execute(&self, call: &ToolCall) -> ToolOutput {
        match self.tools.get(&call.name) {
            Some(entry) => {
                let mut events = entry.tool.invoke(call).await;
                match events.pop() {
                    Some(ToolEvent::Result(out)) => out,
                    _ => ToolOutput::err(&call.id, "tool produced no result"),
                }
            }
            None => ToolOutput::err(&call.id, format!("unknown tool: {}", call.name)),
        }
    }

    pub fn names(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
