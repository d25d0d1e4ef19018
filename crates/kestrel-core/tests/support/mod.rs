//! Shared fixtures for the crate-level integration tests below. Each test
//! exercises `Agent` purely through its public API against a scripted
//! `ModelProvider`, the same way a real caller (a CLI, a CI runner) would.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use kestrel_config::{Config, PermissionMode, PermissionsConfig, ToolsConfig};
use kestrel_core::{Agent, AgentRuntimeContext, HistoryCompactor, NoopCompactor, PermissionEngine};
use kestrel_model::mock::ScriptedMockProvider;
use kestrel_tools::policy::{ApprovalPolicy, ToolPolicy};
use kestrel_tools::tool::{Tool, ToolCall, ToolOutput};
use kestrel_tools::ToolRegistry;

pub struct SleepyReadTool;
#[async_trait]
impl Tool for SleepyReadTool {
    fn name(&self) -> &str {
        "read_file"
    }
    fn description(&self) -> &str {
        "reads a file after a short delay"
    }
    fn parameters_schema(&self) -> Value {
        json!({"type": "object", "properties": {"path": {"type": "string"}}})
    }
    fn default_policy(&self) -> ApprovalPolicy {
        ApprovalPolicy::Auto
    }
    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let path = call.args.get("path").and_then(|v| v.as_str()).unwrap_or("?").to_string();
        ToolOutput::ok(&call.id, format!("contents of {path}"))
    }
}

/// Stands in for the builtin shell tool without shelling out: mirrors its
/// name, its `shell_command` argument key, and its Ask-by-default policy so
/// the permission engine's shell-specific path is exercised faithfully.
pub struct FakeShellTool;
#[async_trait]
impl Tool for FakeShellTool {
    fn name(&self) -> &str {
        "shell"
    }
    fn description(&self) -> &str {
        "runs a shell command"
    }
    fn parameters_schema(&self) -> Value {
        json!({"type": "object", "properties": {"shell_command": {"type": "string"}}})
    }
    fn default_policy(&self) -> ApprovalPolicy {
        ApprovalPolicy::Ask
    }
    fn is_concurrency_safe(&self) -> bool {
        false
    }
    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        let cmd = call.args.get("shell_command").and_then(|v| v.as_str()).unwrap_or("").to_string();
        ToolOutput::ok(&call.id, format!("ran: {cmd}"))
    }
}

pub fn registry() -> Arc<ToolRegistry> {
    let mut r = ToolRegistry::new();
    r.register(SleepyReadTool);
    r.register(FakeShellTool);
    Arc::new(r)
}

pub fn bypass_permissions() -> Arc<PermissionEngine> {
    let cfg = PermissionsConfig { mode: PermissionMode::Bypass, persistent_allowlist_path: None, ..Default::default() };
    let policy = ToolPolicy::from_config(&ToolsConfig::default());
    Arc::new(PermissionEngine::new(&cfg, policy, None))
}

pub fn default_mode_permissions() -> Arc<PermissionEngine> {
    let cfg = PermissionsConfig { mode: PermissionMode::Default, persistent_allowlist_path: None, ..Default::default() };
    let policy = ToolPolicy::from_config(&ToolsConfig::default());
    Arc::new(PermissionEngine::new(&cfg, policy, None))
}

pub fn agent(
    model: ScriptedMockProvider,
    permissions: Arc<PermissionEngine>,
    compactor: Arc<dyn HistoryCompactor>,
    config: &Config,
) -> Agent {
    Agent::new(
        kestrel_core::Session::new(100_000),
        registry(),
        Arc::new(model),
        permissions,
        AgentRuntimeContext::default(),
        config,
        compactor,
    )
}

pub fn default_agent(model: ScriptedMockProvider) -> Agent {
    agent(model, bypass_permissions(), Arc::new(NoopCompactor), &Config::default())
}
