//! Claude authentication probe.
//!
//! Anthropic keys have historically been accepted either through the
//! `x-api-key` header or as a bearer token. The probe lists models with each
//! strategy in turn and remembers the first one that works, so later
//! generations use it.

use anyhow::Result;
use serde_json::Value;
use tracing::{info, warn};

use crate::http_client::HttpClient;
use crate::provider_registry::{ANTHROPIC_VERSION, ClaudeAuthMethod};
use crate::state::StateStore;

pub const CLAUDE_MODELS_URL: &str = "https://api.anthropic.com/v1/models";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeOutcome {
    pub auth_method: ClaudeAuthMethod,
    pub models: Vec<String>,
    pub message: String,
}

/// Tries `x-api-key`, then bearer auth, and persists the first that lists
/// at least one model.
pub async fn probe_claude_auth(
    http: &dyn HttpClient,
    store: &StateStore,
    api_key: &str,
) -> Result<ProbeOutcome> {
    let api_key = api_key.trim();
    if api_key.is_empty() {
        anyhow::bail!("Claude API key is missing");
    }

    let mut failures = Vec::new();
    for method in [ClaudeAuthMethod::XApiKey, ClaudeAuthMethod::Bearer] {
        match list_models(http, api_key, method).await {
            Ok(models) => {
                info!("Claude auth probe succeeded with {}", method.as_str());
                store.set_claude_auth_method(method);
                let message = format!(
                    "Connected with {} authentication, {} models available",
                    method.as_str(),
                    models.len()
                );
                return Ok(ProbeOutcome {
                    auth_method: method,
                    models,
                    message,
                });
            }
            Err(e) => {
                warn!("Claude auth probe with {} failed: {}", method.as_str(), e);
                failures.push(format!("{}: {}", method.as_str(), e));
            }
        }
    }

    anyhow::bail!("Claude authentication failed ({})", failures.join("; "))
}

async fn list_models(
    http: &dyn HttpClient,
    api_key: &str,
    method: ClaudeAuthMethod,
) -> Result<Vec<String>> {
    let (auth_name, auth_value) = method.header(api_key);
    let headers = [
        (auth_name.as_str(), auth_value.as_str()),
        ("anthropic-version", ANTHROPIC_VERSION),
        ("anthropic-dangerous-direct-browser-access", "true"),
    ];

    let response = http.get(CLAUDE_MODELS_URL, &headers).await?;
    if !response.is_success() {
        anyhow::bail!("HTTP {}: {}", response.status, response.body);
    }

    let data: Value = serde_json::from_str(&response.body)?;
    let models = model_ids(&data);
    if models.is_empty() {
        anyhow::bail!("No models found in response");
    }
    Ok(models)
}

fn model_ids(data: &Value) -> Vec<String> {
    ["data", "models"]
        .iter()
        .filter_map(|key| data.get(*key).and_then(Value::as_array))
        .flatten()
        .filter_map(|model| model.get("id").and_then(Value::as_str))
        .map(str::to_string)
        .collect()
}
