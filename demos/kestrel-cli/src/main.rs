// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT

//! Minimal headless driver for `kestrel-core`.
//!
//! This binary is a demonstration harness, not a product surface: it wires
//! config, a model provider, the builtin tool registry and the permission
//! engine into one `Agent` and runs a single turn to completion, printing
//! events to stdout as they arrive. Anything resembling a real CLI (a TUI,
//! session persistence, slash commands) lives outside the core crates by
//! design and is not this binary's job.

use std::io::Read as _;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;

use kestrel_config::{Config, PermissionMode};
use kestrel_core::{
    Agent, AgentEvent, AgentRuntimeContext, DefaultCompactor, PermissionEngine, Session,
};
use kestrel_tools::{
    ApplyPatchTool, AskQuestionTool, DeleteFileTool, EditFileTool, FindFileTool, FsTool, GlobTool,
    GrepTool, ListDirTool, ReadFileTool, ShellTool, ToolPolicy, ToolRegistry, WriteTool,
};

#[derive(Parser)]
#[command(name = "kestrel-cli", about = "Run a single agent turn and print the events")]
struct Args {
    /// Prompt text. Reads stdin if omitted.
    prompt: Option<String>,

    /// Force non-interactive permission mode, auto-approving everything the
    /// tool policy doesn't explicitly deny.
    #[arg(long)]
    bypass_permissions: bool,
}

fn build_registry() -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register(FsTool);
    registry.register(ReadFileTool);
    registry.register(WriteTool);
    registry.register(EditFileTool);
    registry.register(DeleteFileTool);
    registry.register(FindFileTool);
    registry.register(ListDirTool);
    registry.register(GlobTool);
    registry.register(GrepTool);
    registry.register(ApplyPatchTool);
    registry.register(AskQuestionTool::new_headless());
    registry
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let prompt = match args.prompt {
        Some(p) => p,
        None => {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .context("reading prompt from stdin")?;
            buf
        }
    };
    if prompt.trim().is_empty() {
        anyhow::bail!("no prompt given (pass it as an argument or pipe it on stdin)");
    }

    let mut config: Config = kestrel_config::load(None).context("loading config")?;
    if args.bypass_permissions {
        config.permissions.mode = PermissionMode::Bypass;
    }

    let mut registry = build_registry();
    registry.register(ShellTool {
        timeout_secs: config.tools.timeout_secs,
    });
    let registry = Arc::new(registry);

    let provider = kestrel_config::build_provider(&config.model).context("building model provider")?;
    let model = Arc::from(provider);

    let tool_policy = ToolPolicy::from_config(&config.tools);
    let permissions = Arc::new(PermissionEngine::new(&config.permissions, tool_policy, None));

    let session = Session::new(config.model.max_tokens.unwrap_or(1_000_000) as usize);
    let runtime = AgentRuntimeContext::default();
    let compactor = Arc::new(DefaultCompactor);

    let mut agent = Agent::new(session, registry, model, permissions, runtime, &config, compactor);

    let cancel = CancellationToken::new();
    let mut exit_code = 0;
    let result = agent
        .submit(prompt, Some(&cancel), &mut |event| print_event(&event))
        .await;

    if let Err(err) = result {
        eprintln!("error: {err}");
        exit_code = 1;
    }

    std::process::exit(exit_code);
}

fn print_event(event: &AgentEvent) {
    match event {
        AgentEvent::TextDelta(text) => print!("{text}"),
        AgentEvent::TextComplete(_) => println!(),
        AgentEvent::ThinkingDelta(_) | AgentEvent::ThinkingComplete(_) => {}
        AgentEvent::ToolCallStarted(call) => {
            eprintln!("\n-> {} {}", call.name, call.args);
        }
        AgentEvent::ToolProgress { call_id, snapshot } => {
            eprintln!("   [{call_id}] {snapshot}");
        }
        AgentEvent::ToolCallFinished {
            tool_name,
            output,
            is_error,
            ..
        } => {
            let tag = if *is_error { "error" } else { "ok" };
            eprintln!("<- {tool_name} ({tag}): {}", truncate(output, 400));
        }
        AgentEvent::ContextCompacted {
            tokens_before,
            tokens_after,
        } => {
            eprintln!("[context compacted: {tokens_before} -> {tokens_after} tokens]");
        }
        AgentEvent::TokenUsage { .. } => {}
        AgentEvent::TurnComplete => {}
        AgentEvent::Error(msg) => eprintln!("[error] {msg}"),
        AgentEvent::TodoUpdate(_) => {}
        AgentEvent::Aborted { partial_text } => {
            eprintln!("\n[aborted] {partial_text}");
        }
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        format!("{}...", &s[..max])
    }
}
