// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::debug;

use crate::Config;

/// Ordered list of config file locations searched from lowest to highest
/// priority, newest format first within each tier. Later files override
/// earlier ones; both YAML and TOML are accepted so a deployment can carry
/// whichever its surrounding tooling already speaks (§1.3).
fn config_search_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();

    paths.push(PathBuf::from("/etc/kestrel/config.toml"));
    paths.push(PathBuf::from("/etc/kestrel/config.yaml"));
    paths.push(PathBuf::from("/etc/kestrel/config.yml"));

    if let Some(cfg) = dirs::config_dir() {
        paths.push(cfg.join("kestrel/config.toml"));
        paths.push(cfg.join("kestrel/config.yaml"));
        paths.push(cfg.join("kestrel/config.yml"));
    }

    paths.extend(project_local_paths(&std::env::current_dir().unwrap_or_default()));

    paths
}

/// Workspace-local config files, searched from the current directory up to
/// the nearest ancestor containing one, so a config dropped at a repo root
/// is picked up from any subdirectory the agent is invoked in.
fn project_local_paths(start: &Path) -> Vec<PathBuf> {
    const NAMES: [&str; 6] = [
        ".kestrel/config.toml",
        ".kestrel/config.yaml",
        ".kestrel/config.yml",
        ".kestrel.toml",
        ".kestrel.yaml",
        ".kestrel.yml",
    ];

    let mut dir = Some(start);
    let mut found: Option<Vec<PathBuf>> = None;
    while let Some(d) = dir {
        let layer: Vec<PathBuf> = NAMES.iter().map(|n| d.join(n)).filter(|p| p.is_file()).collect();
        if !layer.is_empty() {
            found = Some(layer);
            break;
        }
        dir = d.parent();
    }
    found.unwrap_or_default()
}

/// Environment variables that override individual settings after every file
/// layer has merged, mirroring the driver-registry's own API-key-from-env
/// fallback (`kestrel-model`'s provider resolution) at the config-loader
/// level instead of per-provider.
const ENV_OVERRIDES: &[(&str, &[&str])] = &[
    ("KESTREL_MODEL_PROVIDER", &["model", "provider"]),
    ("KESTREL_MODEL_NAME", &["model", "name"]),
    ("KESTREL_MODEL_API_KEY", &["model", "api_key"]),
    ("KESTREL_PERMISSIONS_MODE", &["permissions", "mode"]),
];

/// Load configuration by merging all discovered file layers, then an
/// explicit `--config` path if given, then environment overrides.
pub fn load(extra: Option<&Path>) -> anyhow::Result<Config> {
    let mut merged = serde_yaml::Value::Mapping(serde_yaml::Mapping::new());

    for path in config_search_paths() {
        if path.is_file() {
            debug!(path = %path.display(), "loading config layer");
            let layer = read_layer(&path)?;
            merge_yaml(&mut merged, layer);
        }
    }

    if let Some(p) = extra {
        debug!(path = %p.display(), "loading explicit config");
        let layer = read_layer(p)?;
        merge_yaml(&mut merged, layer);
    }

    apply_env_overrides(&mut merged);

    let config: Config = if matches!(merged, serde_yaml::Value::Mapping(ref m) if m.is_empty()) {
        Config::default()
    } else {
        serde_yaml::from_value(merged).unwrap_or_default()
    };
    Ok(config)
}

/// Parse one config file, dispatching on its extension (`.toml` vs. YAML);
/// both are normalised into the same `serde_yaml::Value` tree so the merge
/// and override steps below never need to know which format a layer came
/// from.
fn read_layer(path: &Path) -> anyhow::Result<serde_yaml::Value> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    if path.extension().and_then(|e| e.to_str()) == Some("toml") {
        let toml_value: toml::Value =
            toml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        let json = serde_json::to_value(toml_value).with_context(|| format!("normalising {}", path.display()))?;
        serde_yaml::to_value(json).with_context(|| format!("normalising {}", path.display()))
    } else {
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }
}

/// Apply each set `KESTREL_*` environment variable over the merged tree,
/// creating intermediate mapping levels as needed.
fn apply_env_overrides(merged: &mut serde_yaml::Value) {
    for (var, path) in ENV_OVERRIDES {
        if let Ok(value) = std::env::var(var) {
            set_path(merged, path, serde_yaml::Value::String(value));
        }
    }
}

fn set_path(root: &mut serde_yaml::Value, path: &[&str], value: serde_yaml::Value) {
    let Some((head, rest)) = path.split_first() else {
        *root = value;
        return;
    };
    if !matches!(root, serde_yaml::Value::Mapping(_)) {
        *root = serde_yaml::Value::Mapping(serde_yaml::Mapping::new());
    }
    let serde_yaml::Value::Mapping(map) = root else { unreachable!() };
    let entry = map
        .entry(serde_yaml::Value::String(head.to_string()))
        .or_insert(serde_yaml::Value::Mapping(serde_yaml::Mapping::new()));
    set_path(entry, rest, value);
}

/// Deep-merge `src` into `dst`; src wins on scalar conflicts.
fn merge_yaml(dst: &mut serde_yaml::Value, src: serde_yaml::Value) {
    match (dst, src) {
        (serde_yaml::Value::Mapping(d), serde_yaml::Value::Mapping(s)) => {
            for (k, v) in s {
                let entry = d
                    .entry(k)
                    .or_insert(serde_yaml::Value::Mapping(serde_yaml::Mapping::new()));
                merge_yaml(entry, v);
            }
        }
        (dst, src) => *dst = src,
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn val(s: &str) -> serde_yaml::Value {
        serde_yaml::from_str(s).unwrap()
    }

    #[test]
    fn merge_scalar_src_wins() {
        let mut dst = val("x: 1");
        let src = val("x: 2");
        merge_yaml(&mut dst, src);
        assert_eq!(dst["x"].as_i64(), Some(2));
    }

    #[test]
    fn merge_preserves_keys_not_in_src() {
        let mut dst = val("a: 1\nb: 2");
        let src = val("b: 99");
        merge_yaml(&mut dst, src);
        assert_eq!(dst["a"].as_i64(), Some(1));
        assert_eq!(dst["b"].as_i64(), Some(99));
    }

    #[test]
    fn merge_nested_tables() {
        let mut dst = val("model:\n  provider: openai\n  name: gpt-4o");
        let src = val("model:\n  name: gpt-4o-mini");
        merge_yaml(&mut dst, src);
        assert_eq!(dst["model"]["provider"].as_str(), Some("openai"));
        assert_eq!(dst["model"]["name"].as_str(), Some("gpt-4o-mini"));
    }

    #[test]
    fn load_returns_error_when_explicit_path_missing() {
        let result = load(Some(Path::new("/tmp/kestrel_nonexistent_config_xyz.yaml")));
        assert!(result.is_err());
    }

    #[test]
    fn load_with_no_extra_path_returns_defaults() {
        let cfg = load(None).unwrap();
        assert_eq!(cfg.model.provider, "gemini");
    }

    #[test]
    fn load_explicit_yaml_file_overrides_defaults() {
        use std::io::Write;
        let mut f = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(f, "model:\n  provider: gemini\n  name: test-model").unwrap();
        let cfg = load(Some(f.path())).unwrap();
        assert_eq!(cfg.model.provider, "gemini");
        assert_eq!(cfg.model.name, "test-model");
    }

    #[test]
    fn load_explicit_toml_file_is_accepted() {
        use std::io::Write;
        let mut f = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(f, "[model]\nprovider = \"gemini\"\nname = \"toml-model\"").unwrap();
        let cfg = load(Some(f.path())).unwrap();
        assert_eq!(cfg.model.name, "toml-model");
    }

    #[test]
    fn set_path_creates_intermediate_mappings() {
        let mut merged = serde_yaml::Value::Mapping(serde_yaml::Mapping::new());
        set_path(&mut merged, &["model", "provider"], serde_yaml::Value::String("anthropic".into()));
        assert_eq!(merged["model"]["provider"].as_str(), Some("anthropic"));
    }

    #[test]
    fn env_override_wins_over_file_layer() {
        std::env::set_var("KESTREL_MODEL_NAME", "env-model");
        let mut merged = val("model:\n  provider: gemini\n  name: file-model");
        apply_env_overrides(&mut merged);
        std::env::remove_var("KESTREL_MODEL_NAME");
        assert_eq!(merged["model"]["name"].as_str(), Some("env-model"));
    }

    #[test]
    fn project_local_search_walks_up_to_nearest_ancestor() {
        let root = tempfile::tempdir().unwrap();
        std::fs::write(root.path().join(".kestrel.yaml"), "model:\n  provider: gemini\n").unwrap();
        let nested = root.path().join("a/b/c");
        std::fs::create_dir_all(&nested).unwrap();
        let found = project_local_paths(&nested);
        assert_eq!(found, vec![root.path().join(".kestrel.yaml")]);
    }
}
