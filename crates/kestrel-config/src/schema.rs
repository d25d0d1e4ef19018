// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Resolved configuration structs (§1.3 "Ambient stack — configuration").
//!
//! The core receives these already resolved; it never reads a file itself.
//! This crate is the client-side loader a hosting binary uses to go from
//! on-disk YAML plus environment variables to these structs.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub permissions: PermissionsConfig,
    #[serde(default)]
    pub concurrency: ConcurrencyConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Provider identifier. Only "gemini" is wired up by `kestrel-model`
    /// today; the field stays a string so config files forward-compatibly
    /// name other drivers before they exist.
    pub provider: String,
    /// Model name forwarded to the provider API.
    pub name: String,
    /// Environment variable that holds the API key (read at runtime).
    pub api_key_env: Option<String>,
    /// Explicit API key; prefer api_key_env in config files to avoid secrets
    /// in version-controlled files.
    pub api_key: Option<String>,
    /// Base URL override. Useful for local proxies or regional endpoints.
    pub base_url: Option<String>,
    /// Maximum tokens to request in a single completion.
    pub max_tokens: Option<u32>,
    /// Sampling temperature (0.0-2.0).
    pub temperature: Option<f32>,
}

impl ModelConfig {
    /// Resolve the API key: explicit value first, then the named env var,
    /// then the provider's conventional env var.
    pub fn resolved_api_key(&self) -> Option<String> {
        if let Some(k) = &self.api_key {
            return Some(k.clone());
        }
        if let Some(var) = &self.api_key_env {
            if let Ok(v) = std::env::var(var) {
                return Some(v);
            }
        }
        std::env::var("GEMINI_API_KEY").ok()
    }

    pub fn request_timeout(&self) -> Duration {
        TimeoutConfig::default().request_timeout()
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            provider: "gemini".into(),
            name: "gemini-2.0-flash-exp".into(),
            api_key_env: None,
            api_key: None,
            base_url: None,
            max_tokens: Some(8192),
            temperature: Some(0.2),
        }
    }
}

fn default_max_tool_rounds() -> u32 {
    200
}
fn default_compaction_threshold() -> f32 {
    0.85
}

/// Compaction checkpoint format (§4.I).
///
/// `Structured` (default) asks the model for a typed Markdown checkpoint
/// with fixed sections; `Narrative` uses a free-form summarisation prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CompactionStrategy {
    #[default]
    Structured,
    Narrative,
}

impl std::fmt::Display for CompactionStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Structured => write!(f, "structured"),
            Self::Narrative => write!(f, "narrative"),
        }
    }
}

fn default_compaction_keep_recent() -> usize {
    6
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Maximum number of autonomous tool-call rounds before stopping (§4.H
    /// step 10 loop guard).
    #[serde(default = "default_max_tool_rounds")]
    pub max_tool_rounds: u32,
    /// Token fraction at which the auto-compact check (§4.I) fires.
    #[serde(default = "default_compaction_threshold")]
    pub compaction_threshold: f32,
    /// Compaction checkpoint format passed to `compact_session_with_strategy`.
    #[serde(default)]
    pub compaction_strategy: CompactionStrategy,
    /// Messages preserved verbatim by `emergency_compact`'s fallback path.
    #[serde(default = "default_compaction_keep_recent")]
    pub compaction_keep_recent: usize,
    /// System prompt override; leave None to use the built-in prompt.
    #[serde(default)]
    pub system_prompt: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_tool_rounds: default_max_tool_rounds(),
            compaction_threshold: default_compaction_threshold(),
            compaction_strategy: CompactionStrategy::default(),
            compaction_keep_recent: default_compaction_keep_recent(),
            system_prompt: None,
        }
    }
}

/// Mode-driven permission policy (§4.E).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum PermissionMode {
    /// Confirm anything the tool itself flags as needing permission.
    Default,
    /// Confirm more aggressively; used for untrusted input.
    Safe,
    /// Never confirm; every call proceeds (explicit opt-in only).
    Bypass,
    /// Confirm everything, including tools that would otherwise be auto-approved.
    Restricted,
}

impl Default for PermissionMode {
    fn default() -> Self {
        Self::Default
    }
}

impl std::fmt::Display for PermissionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Default => "default",
            Self::Safe => "safe",
            Self::Bypass => "bypass",
            Self::Restricted => "restricted",
        };
        write!(f, "{s}")
    }
}

fn default_allowlist_path() -> Option<String> {
    dirs::config_dir().map(|d| d.join("kestrel/permissions.json").to_string_lossy().into_owned())
}

fn default_allowed_tools() -> Vec<String> {
    vec!["*".to_string()]
}

/// Per-mode restriction set (§4.E steps 3, 6, 7): which tools a mode may
/// invoke at all, and whether that mode skips validation/confirmation
/// entirely.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModeRestriction {
    /// Tool names this mode may invoke; `"*"` matches every tool.
    #[serde(default = "default_allowed_tools")]
    pub allowed_tools: Vec<String>,
    /// When set, this mode grants immediately without reaching the
    /// confirmation/allow-list steps at all (step 6).
    #[serde(default)]
    pub bypass_validation: bool,
    /// When unset, this mode never requires confirmation, even for tools
    /// that would otherwise ask (step 7).
    #[serde(default = "default_true")]
    pub require_confirmation: bool,
}

impl Default for ModeRestriction {
    fn default() -> Self {
        Self { allowed_tools: default_allowed_tools(), bypass_validation: false, require_confirmation: true }
    }
}

fn default_mode_restrictions() -> HashMap<PermissionMode, ModeRestriction> {
    let mut map = HashMap::new();
    map.insert(PermissionMode::Bypass, ModeRestriction { bypass_validation: true, ..ModeRestriction::default() });
    map
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionsConfig {
    #[serde(default)]
    pub mode: PermissionMode,
    /// Where the persistent allow-list (§4.E) is stored; `None` disables
    /// persistence and restricts remembered decisions to the session.
    #[serde(default = "default_allowlist_path")]
    pub persistent_allowlist_path: Option<String>,
    /// Session-level safety toggle, independent of `mode == safe` (step 8):
    /// while set, `mode = default` still requires confirmation for
    /// mutating tools; clearing it makes default mode fully permissive.
    #[serde(default = "default_true")]
    pub safe_mode: bool,
    /// Per-mode tool allow-list and confirmation-skip flags. Modes absent
    /// from this map fall back to [`ModeRestriction::default`], except
    /// `bypass` which defaults to `bypass_validation = true`.
    #[serde(default = "default_mode_restrictions")]
    pub restrictions: HashMap<PermissionMode, ModeRestriction>,
}

impl PermissionsConfig {
    /// The effective restriction set for this config's `mode`.
    pub fn restriction(&self) -> ModeRestriction {
        self.restrictions.get(&self.mode).cloned().unwrap_or_else(|| {
            if self.mode == PermissionMode::Bypass {
                ModeRestriction { bypass_validation: true, ..ModeRestriction::default() }
            } else {
                ModeRestriction::default()
            }
        })
    }
}

impl Default for PermissionsConfig {
    fn default() -> Self {
        Self {
            mode: PermissionMode::default(),
            persistent_allowlist_path: default_allowlist_path(),
            safe_mode: true,
            restrictions: default_mode_restrictions(),
        }
    }
}

fn default_concurrency_cap() -> u32 {
    4
}

/// §5 "Concurrency model": cap is clamped to [1, 20].
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ConcurrencyConfig {
    #[serde(default = "default_concurrency_cap")]
    pub cap: u32,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self { cap: default_concurrency_cap() }
    }
}

impl ConcurrencyConfig {
    pub fn clamped_cap(&self) -> usize {
        self.cap.clamp(1, 20) as usize
    }
}

fn default_max_attempts() -> u32 {
    3
}
fn default_base_delay_ms() -> u64 {
    500
}
fn default_jitter_cap_ms() -> u64 {
    250
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_jitter_cap_ms")]
    pub jitter_cap_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self { max_attempts: default_max_attempts(), base_delay_ms: default_base_delay_ms(), jitter_cap_ms: default_jitter_cap_ms() }
    }
}

impl RetryConfig {
    pub fn to_transport(self) -> kestrel_model::RetryConfig {
        kestrel_model::RetryConfig {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.base_delay_ms),
            jitter_cap: Duration::from_millis(self.jitter_cap_ms),
        }
    }
}

fn default_timeout_secs() -> u64 {
    90
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TimeoutConfig {
    #[serde(default = "default_timeout_secs")]
    pub request_secs: u64,
    #[serde(default = "default_timeout_secs")]
    pub idle_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self { request_secs: default_timeout_secs(), idle_secs: default_timeout_secs() }
    }
}

impl TimeoutConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_secs)
    }
}

/// Glob allow/deny patterns consumed by the tool registry's default policy
/// (§3 "Tool capability record").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    pub auto_approve_patterns: Vec<String>,
    pub deny_patterns: Vec<String>,
    pub timeout_secs: u64,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            auto_approve_patterns: vec!["cat *".into(), "ls *".into(), "find *".into(), "rg *".into(), "grep *".into()],
            deny_patterns: vec!["rm -rf /*".into(), "dd if=*".into()],
            timeout_secs: 30,
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_default_model_provider_is_gemini() {
        assert_eq!(Config::default().model.provider, "gemini");
    }

    #[test]
    fn config_default_permission_mode_is_default() {
        assert_eq!(Config::default().permissions.mode, PermissionMode::Default);
    }

    #[test]
    fn concurrency_cap_clamps_to_twenty() {
        let c = ConcurrencyConfig { cap: 999 };
        assert_eq!(c.clamped_cap(), 20);
    }

    #[test]
    fn concurrency_cap_clamps_to_one() {
        let c = ConcurrencyConfig { cap: 0 };
        assert_eq!(c.clamped_cap(), 1);
    }

    #[test]
    fn concurrency_cap_default_is_four() {
        assert_eq!(ConcurrencyConfig::default().clamped_cap(), 4);
    }

    #[test]
    fn retry_config_converts_to_transport_retry_config() {
        let cfg = RetryConfig { max_attempts: 5, base_delay_ms: 100, jitter_cap_ms: 50 };
        let t = cfg.to_transport();
        assert_eq!(t.max_attempts, 5);
        assert_eq!(t.base_delay, Duration::from_millis(100));
    }

    #[test]
    fn timeout_config_defaults_to_ninety_seconds() {
        let t = TimeoutConfig::default();
        assert_eq!(t.request_timeout(), Duration::from_secs(90));
        assert_eq!(t.idle_timeout(), Duration::from_secs(90));
    }

    #[test]
    fn model_config_resolves_api_key_from_explicit_field() {
        let m = ModelConfig { api_key: Some("sk-explicit".into()), ..ModelConfig::default() };
        assert_eq!(m.resolved_api_key().as_deref(), Some("sk-explicit"));
    }

    #[test]
    fn permission_mode_display() {
        assert_eq!(PermissionMode::Bypass.to_string(), "bypass");
        assert_eq!(PermissionMode::Restricted.to_string(), "restricted");
    }

    #[test]
    fn config_deserialises_partial_yaml_fills_defaults() {
        let yaml = "model:\n  provider: gemini\n  name: gemini-2.0-flash-exp\n";
        let c: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(c.agent.max_tool_rounds, AgentConfig::default().max_tool_rounds);
        assert_eq!(c.concurrency.cap, 4);
    }

    #[test]
    fn config_round_trips_through_yaml() {
        let c = Config::default();
        let yaml = serde_yaml::to_string(&c).unwrap();
        let back: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(back.model.provider, c.model.provider);
        assert_eq!(back.permissions.mode, c.permissions.mode);
    }
}
