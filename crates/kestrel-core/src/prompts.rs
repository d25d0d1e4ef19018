// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use chrono::Local;
use std::path::Path;

/// Optional contextual blocks that can be injected into the system prompt.
#[derive(Debug, Default)]
pub struct PromptContext<'a> {
    /// Absolute path to the project root (from `.git` detection).
    pub project_root: Option<&'a Path>,
    /// Pre-formatted git context (branch, commit, dirty status).
    ///
    /// **Caching note**: this field is *volatile* — it changes with every
    /// commit and every file edit (dirty count). When prompt caching is in
    /// play this content belongs in a separate, uncached system block so the
    /// stable prefix stays cacheable across turns.
    pub git_context: Option<&'a str>,
    /// Contents of the project context file (`AGENTS.md`, `.kestrel/context.md`, …).
    pub project_context_file: Option<&'a str>,
    /// Pre-formatted CI environment block.
    ///
    /// **Caching note**: like `git_context`, this is volatile between runs.
    pub ci_context: Option<&'a str>,
    /// Text appended verbatim after the Guidelines section.
    pub append: Option<&'a str>,
}

impl<'a> PromptContext<'a> {
    /// Return a version of this context with the volatile fields cleared.
    ///
    /// Used to build the *stable* (cacheable) portion of the system prompt.
    pub fn stable_only(&self) -> Self {
        Self {
            project_root: self.project_root,
            git_context: None,
            project_context_file: self.project_context_file,
            ci_context: None,
            append: self.append,
        }
    }

    /// Format the volatile fields (git + CI context) as a block suitable for
    /// appending to the system prompt outside the cached region.
    ///
    /// Returns `None` when neither git nor CI context is present.
    pub fn dynamic_block(&self) -> Option<String> {
        let git = self
            .git_context
            .filter(|s| !s.trim().is_empty())
            .map(|s| s.to_string());
        let ci = self
            .ci_context
            .filter(|s| !s.trim().is_empty())
            .map(|s| s.to_string());
        match (git, ci) {
            (None, None) => None,
            (Some(g), None) => Some(g),
            (None, Some(c)) => Some(c),
            (Some(g), Some(c)) => Some(format!("{g}\n\n{c}")),
        }
    }
}

// ─── Guidelines ───────────────────────────────────────────────────────────

mod guidelines {
    pub fn general() -> &'static str {
        "- Be concise and precise. Use tools instead of guessing.\n\
         - Confirm destructive or irreversible actions before taking them."
    }

    pub fn tool_usage() -> &'static str {
        "- Prefer `edit_file` over `write` for modifying existing files (preserves surrounding context).\n\
         - Discovery workflow: `glob` to find files, `grep` to narrow, `read_file` with specific ranges for context.\n\
         - Batch independent `read_file` calls in the same turn rather than issuing them one at a time."
    }

    pub fn code_quality() -> &'static str {
        "- Keep changes scoped to what was asked; avoid speculative refactors.\n\
         - NEVER create new files proactively unless explicitly requested.\n\
         - Write tests alongside new functionality."
    }

    pub fn workflow_efficiency() -> &'static str {
        "- Use `todo_write` for multi-step tasks (3+ steps); update it as steps complete.\n\
         - Batch independent tool calls in parallel to increase throughput."
    }

    pub fn error_handling() -> &'static str {
        "- When a tool fails, try a different approach before asking the user.\n\
         - NEVER skip git hooks or force-push without explicit user permission."
    }
}

fn build_guidelines_section() -> String {
    format!(
        "## Guidelines\n\n\
         ### General Principles\n\
         {}\n\n\
         ### Tool Usage Patterns\n\
         {}\n\n\
         ### Code Quality\n\
         {}\n\n\
         ### Workflow Efficiency\n\
         {}\n\n\
         ### Error Handling\n\
         {}",
        guidelines::general(),
        guidelines::tool_usage(),
        guidelines::code_quality(),
        guidelines::workflow_efficiency(),
        guidelines::error_handling(),
    )
}

/// Build the system prompt for a turn.
///
/// `ctx` carries optional project / CI / git context injected when running
/// headless. When `custom` is set it replaces the generated identity and
/// guidelines sections entirely, but `ctx.append` is still honoured.
pub fn system_prompt(custom: Option<&str>, ctx: PromptContext<'_>) -> String {
    if let Some(custom) = custom {
        if let Some(extra) = ctx.append {
            return format!("{}\n\n{}", custom.trim_end(), extra);
        }
        return custom.to_string();
    }

    let agent_identity = format!(
        "You are Kestrel, an agentic coding assistant.\n\n\
         Current date and time: `{current_date_time}`\n\
         Current working directory: `{current_working_directory}`",
        current_date_time = Local::now().format("%Y-%m-%d %H:%M:%S"),
        current_working_directory = ctx
            .project_root
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| std::env::current_dir()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|_| "unknown".into())),
    );

    let mut sections = vec![agent_identity, build_guidelines_section()];

    if let Some(file) = ctx.project_context_file {
        if !file.trim().is_empty() {
            sections.push(format!("## Project Context\n\n{file}"));
        }
    }

    if let Some(dynamic) = ctx.dynamic_block() {
        sections.push(dynamic);
    }

    if let Some(extra) = ctx.append {
        sections.push(extra.to_string());
    }

    sections.join("\n\n")
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
