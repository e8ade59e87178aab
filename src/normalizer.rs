//! Response normalizer: raw provider text in, clean JSON text out.
//!
//! Models like to wrap JSON in markdown fences or chat around it. The
//! normalizer strips that, then re-serializes with 2-space indentation. When
//! the result still does not parse, the provider's [`ParsePolicy`] decides
//! between keeping the cleaned text and failing the generation.

use regex::Regex;
use serde_json::Value;
use std::sync::LazyLock;
use tracing::{debug, warn};

use crate::error::GenerationError;
use crate::provider_registry::{ParsePolicy, ProviderDescriptor, ProviderId};

static LEADING_FENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^```(?:json)?\s*").expect("valid leading fence regex"));
static TRAILING_FENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s*```$").expect("valid trailing fence regex"));
static ANY_FENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"```(?:json)?\s*").expect("valid fence regex"));

/// Explanatory text Grok tends to put around the JSON.
static GROK_CHATTER: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)^Here's the JSON for your workflow:\s*",
        r"(?i)^Here is the JSON:\s*",
        r"(?i)^Here's the n8n workflow JSON:\s*",
        r"(?i)^The generated JSON:\s*",
        r"(?i)\s*This JSON can be imported into n8n\.\s*$",
        r"(?i)\s*You can import this JSON into n8n\.\s*$",
    ]
    .iter()
    .map(|pattern| Regex::new(pattern).expect("valid chatter regex"))
    .collect()
});

/// Cleans and re-serializes the text a provider generated.
pub fn normalize(raw: &str, provider: &dyn ProviderDescriptor) -> Result<String, GenerationError> {
    let mut cleaned = strip_outer_fence(raw.trim());

    match provider.id() {
        ProviderId::Claude => {
            if cleaned.contains("```") {
                cleaned = ANY_FENCE.replace_all(&cleaned, "").trim().to_string();
            }
        }
        ProviderId::Grok => cleaned = clean_grok_response(&cleaned),
        _ => {}
    }

    if cleaned.is_empty() {
        return Err(GenerationError::Format(format!(
            "No content generated by {}",
            provider.label()
        )));
    }

    match reserialize(&cleaned) {
        Ok(pretty) => Ok(pretty),
        Err(e) => match provider.parse_policy() {
            ParsePolicy::Lenient => {
                warn!(provider = %provider.id(), error = %e, "Could not parse JSON response, keeping cleaned text");
                Ok(cleaned)
            }
            ParsePolicy::Strict => Err(GenerationError::Format(format!(
                "Invalid JSON response: {}",
                e
            ))),
        },
    }
}

/// Removes one leading and one trailing markdown fence.
pub fn strip_outer_fence(text: &str) -> String {
    if !text.contains("```") {
        return text.to_string();
    }
    let without_leading = LEADING_FENCE.replace(text, "");
    TRAILING_FENCE.replace(&without_leading, "").into_owned()
}

/// Cuts everything outside the outermost braces, then known chatter.
pub fn clean_grok_response(text: &str) -> String {
    let mut cleaned = text;

    if let Some(first) = cleaned.find('{') {
        if first > 0 {
            debug!(removed = first, "Removing content before first brace");
            cleaned = &cleaned[first..];
        }
    }
    if let Some(last) = cleaned.rfind('}') {
        if last + 1 < cleaned.len() {
            debug!(removed = cleaned.len() - last - 1, "Removing content after last brace");
            cleaned = &cleaned[..=last];
        }
    }

    let mut cleaned = cleaned.to_string();
    if cleaned.contains("```") {
        cleaned = ANY_FENCE.replace_all(&cleaned, "").into_owned();
        cleaned = TRAILING_FENCE.replace_all(&cleaned, "").into_owned();
    }

    for pattern in GROK_CHATTER.iter() {
        cleaned = pattern.replace(&cleaned, "").into_owned();
    }

    cleaned.trim().to_string()
}

fn reserialize(text: &str) -> Result<String, serde_json::Error> {
    let value: Value = serde_json::from_str(text)?;
    serde_json::to_string_pretty(&value)
}
