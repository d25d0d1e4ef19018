// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Runtime context for an agent session.
//!
//! This is separate from [`kestrel_config::AgentConfig`], which holds only
//! config-file fields. [`AgentRuntimeContext`] carries values detected or
//! supplied at startup (project root, git/CI context, prompt overrides,
//! the skill a turn's effective tool set is constrained by).

use std::path::PathBuf;

/// A named constraint on which tools are available during a turn.
///
/// A skill with `allowed_tools: None` imposes no constraint (the full
/// registry stays available); `Some(names)` narrows the effective tool set
/// to the intersection of the registry and `names`.
#[derive(Debug, Clone)]
pub struct Skill {
    pub name: String,
    pub allowed_tools: Option<Vec<String>>,
}

/// Environment-detected context injected into an agent at construction time.
#[derive(Debug, Default, Clone)]
pub struct AgentRuntimeContext {
    /// Absolute path to the project root (found via `.git` walk-up).
    pub project_root: Option<PathBuf>,
    /// Pre-formatted git context block (branch, commit, dirty status).
    pub git_context_note: Option<String>,
    /// Pre-formatted CI environment context block.
    pub ci_context_note: Option<String>,
    /// Contents of the project context file (`.kestrel/context.md`, `AGENTS.md`, …).
    pub project_context_file: Option<String>,
    /// Text appended to the default system prompt (from `--append-system-prompt`).
    pub append_system_prompt: Option<String>,
    /// Full system prompt override (from `--system-prompt-file`).
    /// When set, replaces `AgentConfig::system_prompt` entirely.
    pub system_prompt_override: Option<String>,
    /// Active skill, if any, constraining this turn's effective tool set.
    pub active_skill: Option<Skill>,
    /// Contextual reminder lines injected into the latest text-bearing user
    /// message each turn (§4.H step 3). Never persisted into session
    /// history — applied to the outgoing request only.
    pub context_reminders: Vec<String>,
}

impl AgentRuntimeContext {
    /// Narrow `names` (the full registry's tool names) to the set usable
    /// under the active skill, if one is set.
    pub fn effective_tool_names(&self, names: &[String]) -> Vec<String> {
        match self.active_skill.as_ref().and_then(|s| s.allowed_tools.as_ref()) {
            None => names.to_vec(),
            Some(allowed) => names.iter().filter(|n| allowed.contains(n)).cloned().collect(),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_skill_keeps_all_tools() {
        let ctx = AgentRuntimeContext::default();
        let names = vec!["a".to_string(), "b".to_string()];
        assert_eq!(ctx.effective_tool_names(&names), names);
    }

    #[test]
    fn skill_with_no_constraint_keeps_all_tools() {
        let ctx = AgentRuntimeContext {
            active_skill: Some(Skill { name: "s".into(), allowed_tools: None }),
            ..Default::default()
        };
        let names = vec!["a".to_string(), "b".to_string()];
        assert_eq!(ctx.effective_tool_names(&names), names);
    }

    #[test]
    fn skill_constraint_narrows_to_intersection() {
        let ctx = AgentRuntimeContext {
            active_skill: Some(Skill {
                name: "read-only".into(),
                allowed_tools: Some(vec!["read_file".into(), "grep".into()]),
            }),
            ..Default::default()
        };
        let names = vec!["read_file".to_string(), "grep".to_string(), "write".to_string()];
        assert_eq!(ctx.effective_tool_names(&names), vec!["read_file".to_string(), "grep".to_string()]);
    }

    #[test]
    fn skill_constraint_naming_unknown_tool_drops_it() {
        let ctx = AgentRuntimeContext {
            active_skill: Some(Skill { name: "s".into(), allowed_tools: Some(vec!["nonexistent".into()]) }),
            ..Default::default()
        };
        let names = vec!["write".to_string()];
        assert!(ctx.effective_tool_names(&names).is_empty());
    }
}
