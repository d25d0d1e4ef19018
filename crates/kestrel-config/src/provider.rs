// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Constructs a [`kestrel_model::ModelProvider`] from resolved configuration.
//!
//! This is the one place the config layer reaches into `kestrel-model`'s
//! types — the dependency runs loader → transport, never the other way, so
//! the transport crate stays free of config-format concerns.

use kestrel_model::{GeminiProvider, ModelProvider};

use crate::ModelConfig;

pub fn build_provider(cfg: &ModelConfig) -> anyhow::Result<Box<dyn ModelProvider>> {
    match cfg.provider.as_str() {
        "gemini" => {
            let api_key = cfg.resolved_api_key().ok_or_else(|| anyhow::anyhow!("no API key configured for provider gemini"))?;
            Ok(Box::new(GeminiProvider::new(api_key, cfg.base_url.clone(), cfg.request_timeout())))
        }
        other => Err(anyhow::anyhow!("unknown model provider: {other}")),
    }
}
