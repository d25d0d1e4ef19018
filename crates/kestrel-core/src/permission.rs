// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Permission engine (§4.E).
//!
//! Decides, for one tool call, whether to run it, refuse it outright, or
//! escalate to whoever is driving the agent (a TUI, a CLI prompt, a CI
//! policy) via an `mpsc`/`oneshot` channel pair. The decision is the
//! eleven-step first-match-wins chain of §4.E: abort, per-mode tool
//! allow-list, the tool's own `needs_permissions`, the high-risk shell
//! classifier, per-mode restriction flags (`bypass_validation`,
//! `require_confirmation`), the session-level safe-mode flag, the effective
//! allow-list built from session/project/persistent grants, and finally the
//! directory-scope re-check for file-editing tools.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use kestrel_config::{ModeRestriction, PermissionMode, PermissionsConfig};
use kestrel_model::cancel::Scope;
use kestrel_tools::policy::{ApprovalPolicy, ToolPolicy};
use kestrel_tools::Tool;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};

/// What the caller is being asked to approve.
#[derive(Debug, Clone)]
pub struct PermissionRequest {
    pub tool: String,
    /// The tool's `render_tool_use_message` output — also the allow-list key body.
    pub rendered_input: String,
    pub description: String,
}

/// The caller's answer to a [`PermissionRequest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionResponse {
    AllowOnce,
    AllowSession,
    AllowProject,
    Deny,
    /// Abort the whole turn, not just this one call.
    Abort,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PermissionDecision {
    Allow,
    Deny(String),
    Abort,
}

/// Persisted, append-only set of `tool(rendered_input)` keys the user has
/// granted project-wide approval for.
#[derive(Debug, Default, Serialize, Deserialize)]
struct PersistedAllowlist {
    keys: HashSet<String>,
}

/// Escalates unresolved decisions to the driver of the agent.
pub struct Escalator {
    tx: mpsc::Sender<(PermissionRequest, oneshot::Sender<PermissionResponse>)>,
}

impl Escalator {
    pub fn new(tx: mpsc::Sender<(PermissionRequest, oneshot::Sender<PermissionResponse>)>) -> Self {
        Self { tx }
    }

    async fn ask(&self, req: PermissionRequest) -> PermissionResponse {
        let (resp_tx, resp_rx) = oneshot::channel();
        if self.tx.send((req, resp_tx)).await.is_err() {
            return PermissionResponse::Deny;
        }
        resp_rx.await.unwrap_or(PermissionResponse::Deny)
    }
}

fn allow_key(tool: &str, rendered_input: &str) -> String {
    format!("{tool}({rendered_input})")
}

/// Matches `Bash(<prefix>:*)`-style allow-list entries: an entry ending in
/// `:*` grants every rendered input sharing that prefix.
fn key_matches(granted: &str, candidate: &str) -> bool {
    if granted == candidate {
        return true;
    }
    granted
        .strip_suffix("*)")
        .and_then(|prefix| prefix.strip_suffix(':'))
        .map(|prefix| candidate.starts_with(prefix) && candidate.ends_with(')'))
        .unwrap_or(false)
}

/// Shown in the canonical step-11 denial message (§4.E).
const PRODUCT_NAME: &str = "Kestrel";

pub struct PermissionEngine {
    mode: PermissionMode,
    safe_mode: bool,
    restriction: ModeRestriction,
    tool_policy: ToolPolicy,
    persistent_path: Option<PathBuf>,
    session_allowed: Mutex<HashSet<String>>,
    project_allowed: Mutex<HashSet<String>>,
    /// Process-wide, never-persisted directory grants for file-editing
    /// tools (§4.E step 10 / grant-persistence note).
    directory_grants: Mutex<HashSet<PathBuf>>,
    escalator: Option<Arc<Escalator>>,
}

impl PermissionEngine {
    pub fn new(cfg: &PermissionsConfig, tool_policy: ToolPolicy, escalator: Option<Arc<Escalator>>) -> Self {
        Self {
            mode: cfg.mode,
            safe_mode: cfg.safe_mode,
            restriction: cfg.restriction(),
            tool_policy,
            persistent_path: cfg.persistent_allowlist_path.as_ref().map(PathBuf::from),
            session_allowed: Mutex::new(HashSet::new()),
            project_allowed: Mutex::new(load_persisted(cfg.persistent_allowlist_path.as_deref())),
            directory_grants: Mutex::new(HashSet::new()),
            escalator,
        }
    }

    #[cfg(test)]
    fn without_persistence(mode: PermissionMode, tool_policy: ToolPolicy, escalator: Option<Arc<Escalator>>) -> Self {
        let restriction = if mode == PermissionMode::Bypass {
            ModeRestriction { bypass_validation: true, ..ModeRestriction::default() }
        } else {
            ModeRestriction::default()
        };
        Self {
            mode,
            safe_mode: true,
            restriction,
            tool_policy,
            persistent_path: None,
            session_allowed: Mutex::new(HashSet::new()),
            project_allowed: Mutex::new(HashSet::new()),
            directory_grants: Mutex::new(HashSet::new()),
            escalator,
        }
    }

    fn already_granted(&self, key: &str) -> bool {
        self.session_allowed.lock().unwrap().iter().any(|g| key_matches(g, key))
            || self.project_allowed.lock().unwrap().iter().any(|g| key_matches(g, key))
    }

    /// Step 10 re-check: does an earlier directory-scope grant cover `path`?
    fn directory_grant_covers(&self, path: &std::path::Path) -> bool {
        self.directory_grants.lock().unwrap().iter().any(|dir| path.starts_with(dir))
    }

    fn grant(&self, response: PermissionResponse, key: &str, write_target: Option<PathBuf>) {
        if matches!(response, PermissionResponse::AllowSession | PermissionResponse::AllowProject) {
            if let Some(path) = write_target {
                // File-editing tools grant a directory-scoped write permission
                // instead of a plain allow-list key, and it is never persisted
                // to disk (§4.E grant-persistence note).
                let dir = path.parent().map(PathBuf::from).unwrap_or(path);
                self.directory_grants.lock().unwrap().insert(dir);
                return;
            }
        }
        match response {
            PermissionResponse::AllowSession => {
                self.session_allowed.lock().unwrap().insert(key.to_string());
            }
            PermissionResponse::AllowProject => {
                self.project_allowed.lock().unwrap().insert(key.to_string());
                self.persist();
            }
            _ => {}
        }
    }

    fn persist(&self) {
        let Some(path) = &self.persistent_path else { return };
        let keys = self.project_allowed.lock().unwrap().clone();
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        if let Ok(file) = std::fs::OpenOptions::new().create(true).write(true).truncate(true).open(path) {
            use fs4::fs_std::FileExt;
            let _ = file.lock_exclusive();
            let _ = serde_json::to_writer_pretty(&file, &PersistedAllowlist { keys });
            let _ = file.unlock();
        }
    }

    /// Decide whether `call` may run against `tool`, consulting the
    /// escalation channel if a human decision is required. `command` is the
    /// rendered shell command for shell-tool-specific policy (cat/ls/rm
    /// glob patterns); pass the empty string for non-shell tools.
    pub async fn decide(&self, tool: &dyn Tool, input: &serde_json::Value, command: &str, scope: &Scope) -> PermissionDecision {
        // Step 1.
        if scope.is_cancelled() {
            return PermissionDecision::Abort;
        }

        // Step 2: `self.mode` is already one of the four known variants —
        // there is no "unknown mode" state to normalise away once parsed.

        // Step 3: per-mode tool-name allow-list, `*` matching everything.
        if !self.restriction.allowed_tools.iter().any(|t| t == "*" || t == tool.name()) {
            return PermissionDecision::Deny(format!("tool not available in {} mode", self.mode));
        }

        // Step 4. Restricted mode confirms everything, including tools that
        // would otherwise auto-approve (its whole purpose per `PermissionMode`),
        // so it never short-circuits here.
        if self.mode != PermissionMode::Restricted && !tool.needs_permissions(input) {
            return PermissionDecision::Allow;
        }

        // Step 5: the high-risk classifier outranks every later step,
        // including bypass_validation and every existing grant — there is
        // no way to pre-authorise a command like `rm -rf /` short of
        // removing it from the classifier itself.
        if !command.is_empty() && is_high_risk_shell_command(command) {
            return PermissionDecision::Deny("Dangerous command requires explicit confirmation every time.".to_string());
        }

        // Step 6.
        if self.restriction.bypass_validation {
            return PermissionDecision::Allow;
        }

        // Step 7.
        if !self.restriction.require_confirmation {
            return PermissionDecision::Allow;
        }

        // Step 8: default mode is permissive unless the session-level safe
        // mode flag is on (on by default — see `PermissionsConfig::safe_mode`).
        if self.mode == PermissionMode::Default && !self.safe_mode {
            return PermissionDecision::Allow;
        }

        let rendered = tool.render_tool_use_message(input, false);
        let key = allow_key(tool.name(), &rendered);

        if !command.is_empty() && self.tool_policy.decide(command) == ApprovalPolicy::Deny {
            return PermissionDecision::Deny(format!("'{command}' matches a deny pattern"));
        }

        // Step 9.
        if self.already_granted(&key) {
            return PermissionDecision::Allow;
        }

        // Step 10: file-editing tools re-check against any directory-scope
        // grant before falling through to the canonical denial.
        if let Some(path) = tool.write_target(input) {
            if self.directory_grant_covers(&path) {
                return PermissionDecision::Allow;
            }
        }

        let Some(escalator) = &self.escalator else {
            // Step 11.
            return PermissionDecision::Deny(format!(
                "{PRODUCT_NAME} requested permissions to use {}, but you haven't granted it yet.",
                tool.name()
            ));
        };

        let req = PermissionRequest {
            tool: tool.name().to_string(),
            rendered_input: rendered,
            description: tool.description().to_string(),
        };
        match escalator.ask(req).await {
            PermissionResponse::AllowOnce => PermissionDecision::Allow,
            r @ (PermissionResponse::AllowSession | PermissionResponse::AllowProject) => {
                self.grant(r, &key, tool.write_target(input));
                PermissionDecision::Allow
            }
            // Step 11.
            PermissionResponse::Deny => PermissionDecision::Deny(format!(
                "{PRODUCT_NAME} requested permissions to use {}, but you haven't granted it yet.",
                tool.name()
            )),
            PermissionResponse::Abort => PermissionDecision::Abort,
        }
    }
}

/// A small, hardcoded classifier for commands that destroy data or the
/// filesystem outright — distinct from the configurable `deny_patterns`
/// glob list, which an operator can edit away. This one can't be (§4.E
/// step 5).
fn is_high_risk_shell_command(command: &str) -> bool {
    let collapsed: String = command.to_lowercase().split_whitespace().collect::<Vec<_>>().join(" ");

    let rm_root = collapsed.contains("rm -rf /") || collapsed.contains("rm -fr /");
    let wipe_device = collapsed.starts_with("dd ")
        && ["of=/dev/sd", "of=/dev/nvme", "of=/dev/hd"].iter().any(|p| collapsed.contains(p));
    let mkfs = collapsed.starts_with("mkfs");
    let fork_bomb = collapsed.chars().filter(|c| !c.is_whitespace()).collect::<String>().contains(":(){:|:&};:");

    rm_root || wipe_device || mkfs || fork_bomb
}

fn load_persisted(path: Option<&str>) -> HashSet<String> {
    let Some(path) = path else { return HashSet::new() };
    let Ok(contents) = std::fs::read_to_string(path) else { return HashSet::new() };
    serde_json::from_str::<PersistedAllowlist>(&contents).map(|p| p.keys).unwrap_or_default()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
