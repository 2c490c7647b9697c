// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

use crate::api::ModelApi;

/// Factory that builds a provider from a model name plus creation params.
///
/// The params given at creation are retained alongside the instance so that
/// logs can round-trip "which provider, with which arguments" without
/// re-deriving it from config.
pub type ModelApiFactory =
    Arc<dyn Fn(&str, &serde_json::Value) -> anyhow::Result<Arc<dyn ModelApi>> + Send + Sync>;

struct RegisteredApi {
    factory: ModelApiFactory,
}

fn registry() -> &'static Mutex<HashMap<String, RegisteredApi>> {
    static REGISTRY: OnceLock<Mutex<HashMap<String, RegisteredApi>>> = OnceLock::new();
    REGISTRY.get_or_init(|| {
        let mut map: HashMap<String, RegisteredApi> = HashMap::new();
        // the mock providers are always available; everything else is
        // registered by the embedding application
        map.insert(
            "mock".to_string(),
            RegisteredApi {
                factory: Arc::new(|_model, args| {
                    let completion = args
                        .get("completion")
                        .and_then(|v| v.as_str())
                        .unwrap_or("Default output from mock/model");
                    Ok(Arc::new(crate::mock::MockApi::new(completion)))
                }),
            },
        );
        Mutex::new(map)
    })
}

/// Register (or replace) a provider factory under `provider_name`.
pub fn register_api(provider_name: &str, factory: ModelApiFactory) {
    registry()
        .lock()
        .unwrap()
        .insert(provider_name.to_string(), RegisteredApi { factory });
}

/// Instantiate a provider from a `"provider/model"` spec string.
///
/// `args` are the creation params forwarded to the factory and persisted
/// with the instance for log round-tripping.
pub fn get_api(spec: &str, args: &serde_json::Value) -> anyhow::Result<Arc<dyn ModelApi>> {
    let (provider, model) = spec
        .split_once('/')
        .ok_or_else(|| anyhow::anyhow!("model spec must be provider/model, got '{spec}'"))?;
    let map = registry().lock().unwrap();
    let registered = map
        .get(provider)
        .ok_or_else(|| anyhow::anyhow!("unknown model provider: {provider}"))?;
    (registered.factory)(model, args)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{GenerateConfig, ToolChoice};
    use crate::types::ChatMessage;

    #[tokio::test]
    async fn mock_provider_is_preregistered() {
        let api = get_api("mock/model", &serde_json::json!({})).unwrap();
        let out = api
            .generate(
                &[ChatMessage::user("q")],
                &[],
                &ToolChoice::Auto,
                &GenerateConfig::default(),
            )
            .await
            .unwrap();
        assert!(out.completion().contains("Default output"));
    }

    #[test]
    fn mock_factory_honors_completion_arg() {
        let api = get_api("mock/model", &serde_json::json!({"completion": "ANSWER: 42"})).unwrap();
        assert_eq!(api.model_name(), "model");
    }

    #[test]
    fn unknown_provider_errors() {
        let err = get_api("nope/model", &serde_json::json!({})).unwrap_err();
        assert!(err.to_string().contains("unknown model provider"));
    }

    #[test]
    fn spec_without_slash_errors() {
        assert!(get_api("invalid", &serde_json::json!({})).is_err());
    }

    #[test]
    fn register_replaces_factory() {
        register_api(
            "custom-test",
            Arc::new(|_m, _a| Ok(Arc::new(crate::mock::MockApi::new("custom")))),
        );
        assert!(get_api("custom-test/x", &serde_json::json!({})).is_ok());
    }
}
