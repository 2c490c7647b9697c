// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::debug;

use crate::Config;

/// Ordered list of config file locations searched from lowest to highest priority.
/// Later files override earlier ones.
fn config_search_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();

    // 1. System-wide default
    paths.push(PathBuf::from("/etc/verdict/config.yaml"));
    paths.push(PathBuf::from("/etc/verdict/config.yml"));

    // 2. XDG / home
    if let Some(home) = dirs::home_dir() {
        paths.push(home.join(".config/verdict/config.yaml"));
        paths.push(home.join(".config/verdict/config.yml"));
    }
    if let Some(cfg) = dirs::config_dir() {
        paths.push(cfg.join("verdict/config.yaml"));
        paths.push(cfg.join("verdict/config.yml"));
    }

    // 3. Workspace-local
    paths.push(PathBuf::from(".verdict/config.yaml"));
    paths.push(PathBuf::from(".verdict/config.yml"));
    paths.push(PathBuf::from("verdict.yaml"));
    paths.push(PathBuf::from("verdict.yml"));

    paths
}

/// Load configuration by merging all discovered YAML files.
/// The `extra` argument may provide an explicit path (e.g. `--config` CLI flag).
///
/// After file layers are merged, `VERDICT_*` environment variables override
/// individual fields so that every CLI flag has an env counterpart usable
/// from CI without a config file.
pub fn load(extra: Option<&Path>) -> anyhow::Result<Config> {
    let mut merged = serde_yaml::Value::Mapping(serde_yaml::Mapping::new());

    for path in config_search_paths() {
        if path.is_file() {
            debug!(path = %path.display(), "loading config layer");
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            let layer: serde_yaml::Value = serde_yaml::from_str(&text)
                .with_context(|| format!("parsing {}", path.display()))?;
            merge_yaml(&mut merged, layer);
        }
    }

    if let Some(p) = extra {
        debug!(path = %p.display(), "loading explicit config");
        let text =
            std::fs::read_to_string(p).with_context(|| format!("reading {}", p.display()))?;
        let layer: serde_yaml::Value =
            serde_yaml::from_str(&text).with_context(|| format!("parsing {}", p.display()))?;
        merge_yaml(&mut merged, layer);
    }

    let mut config: Config = if matches!(merged, serde_yaml::Value::Mapping(ref m) if m.is_empty())
    {
        Config::default()
    } else {
        serde_yaml::from_value(merged).unwrap_or_default()
    };

    apply_env_overrides(&mut config);
    Ok(config)
}

/// Apply `VERDICT_*` environment overrides on top of file-derived config.
fn apply_env_overrides(config: &mut Config) {
    fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
        std::env::var(name).ok().and_then(|v| v.parse().ok())
    }

    if let Some(v) = env_parse("VERDICT_MAX_SAMPLES") {
        config.eval.max_samples = Some(v);
    }
    if let Some(v) = env_parse("VERDICT_MAX_TASKS") {
        config.eval.max_tasks = v;
    }
    if let Some(v) = env_parse("VERDICT_MAX_SUBPROCESSES") {
        config.eval.max_subprocesses = Some(v);
    }
    if let Some(v) = env_parse("VERDICT_MAX_CONNECTIONS") {
        config.eval.max_connections = Some(v);
    }
    if let Some(v) = env_parse("VERDICT_EPOCHS") {
        config.eval.epochs = v;
    }
    if let Ok(v) = std::env::var("VERDICT_EPOCHS_REDUCER") {
        config.eval.epochs_reducer = Some(v);
    }
    if let Ok(v) = std::env::var("VERDICT_FAIL_ON_ERROR") {
        if let Ok(flag) = v.parse::<bool>() {
            config.eval.fail_on_error = crate::FailOnError::Flag(flag);
        } else if let Ok(t) = v.parse::<f64>() {
            config.eval.fail_on_error = crate::FailOnError::Threshold(t);
        }
    }
    if let Some(v) = env_parse("VERDICT_TOKEN_LIMIT") {
        config.eval.token_limit = Some(v);
    }
    if let Some(v) = env_parse("VERDICT_MESSAGE_LIMIT") {
        config.eval.message_limit = Some(v);
    }
    if let Some(v) = env_parse("VERDICT_TIME_LIMIT") {
        config.eval.time_limit = Some(v);
    }
    if let Some(v) = env_parse("VERDICT_WORKING_LIMIT") {
        config.eval.working_limit = Some(v);
    }
    if let Some(v) = env_parse("VERDICT_NO_SANDBOX_CLEANUP") {
        config.eval.no_sandbox_cleanup = v;
    }
    if let Some(v) = env_parse("VERDICT_CACHE") {
        config.cache.enabled = v;
    }
    if let Ok(v) = std::env::var("VERDICT_CACHE_DIR") {
        config.cache.dir = Some(PathBuf::from(v));
    }
    if let Ok(v) = std::env::var("VERDICT_LOG_DIR") {
        config.log.dir = PathBuf::from(v);
    }
    if let Ok(v) = std::env::var("VERDICT_LOG_FORMAT") {
        config.log.format = v;
    }
    if let Some(v) = env_parse("VERDICT_LOG_BUFFER") {
        config.log.buffer = Some(v);
    }
    if let Ok(v) = std::env::var("VERDICT_SCAN_DIR") {
        config.scan.dir = PathBuf::from(v);
    }
    if let Some(v) = env_parse("VERDICT_SCAN_MAX_TASKS") {
        config.scan.max_tasks = v;
    }
    if let Some(v) = env_parse("VERDICT_SCAN_MAX_QUEUE_SIZE") {
        config.scan.max_queue_size = Some(v);
    }
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
