//! Provider registry: one descriptor per supported LLM API.
//!
//! A descriptor knows how to build the single HTTP request for its provider
//! (endpoint, authentication, message schema) and how to pull the generated
//! text back out of the provider's response shape. Descriptors are pure; the
//! only runtime input is the learned Claude header strategy, which is injected
//! when the registry is built.

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;
use tracing::{debug, warn};

use crate::error::GenerationError;
use crate::http_client::HttpResponse;

pub const ANTHROPIC_VERSION: &str = "2023-06-01";
const OPENROUTER_REFERER: &str = "http://localhost";
const OPENROUTER_TITLE: &str = "flowgen";

const USER_REQUEST_MARKER: &str = "\n\n===USER REQUEST===\n";
const JSON_ONLY_REMINDER: &str =
    "\n\nRemember: Return ONLY valid JSON without any markdown code blocks or formatting.";

const GROK_SYSTEM_SUFFIX: &str = "\n\nIt is EXTREMELY important that you return a fully valid, well-structured JSON object. Check your output carefully before responding.";
const GROK_FORMAT_CHECKLIST: &str = "

CRITICAL JSON FORMATTING INSTRUCTIONS:
1. The output MUST be a valid JSON object with NO additional text, markdown, or explanations
2. Do NOT wrap the JSON in code blocks or backticks, return the raw JSON directly
3. Make sure each opening bracket has a closing bracket, especially with nested objects
4. Ensure all quotes are properly escaped within strings
5. Make sure there are no trailing commas in arrays or objects
6. Validate your output is well-formed JSON before responding";

static FENCED_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```(?:json)?(.*?)```").expect("valid fenced block regex"));

/// Closed set of supported providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderId {
    OpenAi,
    Gemini,
    Mistral,
    Claude,
    OpenRouter,
    Grok,
    Groq,
}

impl ProviderId {
    pub const ALL: [ProviderId; 7] = [
        ProviderId::OpenAi,
        ProviderId::Gemini,
        ProviderId::Mistral,
        ProviderId::Claude,
        ProviderId::OpenRouter,
        ProviderId::Grok,
        ProviderId::Groq,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Gemini => "gemini",
            Self::Mistral => "mistral",
            Self::Claude => "claude",
            Self::OpenRouter => "openrouter",
            Self::Grok => "grok",
            Self::Groq => "groq",
        }
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderId {
    type Err = GenerationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|id| id.as_str() == s)
            .ok_or_else(|| GenerationError::Configuration(format!("Invalid provider: {}", s)))
    }
}

/// Header strategy for the Claude API, learned by the auth probe.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClaudeAuthMethod {
    #[default]
    #[serde(rename = "x-api-key")]
    XApiKey,
    #[serde(rename = "bearer")]
    Bearer,
}

impl ClaudeAuthMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::XApiKey => "x-api-key",
            Self::Bearer => "bearer",
        }
    }

    /// The authentication header for this strategy.
    pub fn header(&self, api_key: &str) -> (String, String) {
        match self {
            Self::XApiKey => ("x-api-key".to_string(), api_key.to_string()),
            Self::Bearer => ("Authorization".to_string(), format!("Bearer {}", api_key)),
        }
    }
}

/// What to do when the cleaned response is not valid JSON.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParsePolicy {
    /// Fail the generation with a format error.
    Strict,
    /// Keep the cleaned text verbatim.
    Lenient,
}

/// A fully built provider request.
#[derive(Clone)]
pub struct ApiRequest {
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Value,
}

impl ApiRequest {
    pub fn header_pairs(&self) -> Vec<(&str, &str)> {
        self.headers
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect()
    }
}

impl fmt::Debug for ApiRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let header_names: Vec<&str> = self.headers.iter().map(|(k, _)| k.as_str()).collect();
        let url = self.url.split('?').next().unwrap_or_default();
        f.debug_struct("ApiRequest")
            .field("url", &url)
            .field("headers", &header_names)
            .finish_non_exhaustive()
    }
}

/// Request building and response parsing for one provider.
pub trait ProviderDescriptor: Send + Sync {
    fn id(&self) -> ProviderId;

    fn label(&self) -> &str;

    fn build_request(
        &self,
        api_key: &str,
        model: &str,
        system_prompt: &str,
        user_prompt: &str,
    ) -> ApiRequest;

    /// Extracts the generated text from a decoded 2xx response body.
    fn parse_response(&self, data: &Value) -> Result<String, GenerationError>;

    fn parse_policy(&self) -> ParsePolicy;

    /// Providers with known higher latency get the longer attempt timeout.
    fn is_slow(&self) -> bool {
        false
    }

    /// Prefix for error messages reported by this provider.
    fn error_prefix(&self) -> Option<&str> {
        None
    }

    /// Converts a non-2xx response into a provider error.
    fn error_from_status(&self, status: u16, body: &str) -> GenerationError {
        let detail = serde_json::from_str::<Value>(body)
            .ok()
            .and_then(|data| error_detail(&data))
            .unwrap_or_else(|| {
                let body = body.trim();
                if body.is_empty() {
                    format!("API Error ({})", status)
                } else {
                    format!("API Error ({}): {}", status, body)
                }
            });

        GenerationError::Provider(match self.error_prefix() {
            Some(prefix) => format!("{}{}", prefix, detail),
            None => detail,
        })
    }

    /// Turns a raw HTTP response into extracted text.
    fn parse_body(&self, response: &HttpResponse) -> Result<String, GenerationError> {
        if !response.is_success() {
            warn!(provider = %self.id(), status = response.status, "Provider returned an error status");
            return Err(self.error_from_status(response.status, &response.body));
        }

        let data: Value = serde_json::from_str(&response.body).map_err(|e| {
            GenerationError::Format(format!("Invalid response body from {}: {}", self.label(), e))
        })?;

        let text = self.parse_response(&data)?;
        if text.is_empty() {
            return Err(GenerationError::Format(format!(
                "No content generated by {}",
                self.label()
            )));
        }
        Ok(text)
    }
}

/// Best-effort human message from an `error` payload.
fn error_detail(data: &Value) -> Option<String> {
    match data.get("error") {
        Some(Value::String(message)) => Some(message.clone()),
        Some(error @ Value::Object(_)) => Some(
            error
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| error.to_string()),
        ),
        Some(Value::Null) | None => data
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string),
        Some(other) => Some(other.to_string()),
    }
}

fn has_error(data: &Value) -> bool {
    data.get("error").is_some_and(|e| !e.is_null())
}

fn combined_prompt(system_prompt: &str, user_prompt: &str) -> String {
    format!(
        "{}{}{}{}",
        system_prompt, USER_REQUEST_MARKER, user_prompt, JSON_ONLY_REMINDER
    )
}

fn chat_content(data: &Value) -> Option<&str> {
    data.pointer("/choices/0/message/content")
        .and_then(Value::as_str)
}

fn json_headers() -> Vec<(String, String)> {
    vec![("Content-Type".to_string(), "application/json".to_string())]
}

fn bearer(api_key: &str) -> (String, String) {
    ("Authorization".to_string(), format!("Bearer {}", api_key))
}

// =============================================================================
// OpenAI-compatible chat completions
// =============================================================================

/// OpenAI, Mistral, OpenRouter and Groq share the chat completions schema.
pub struct OpenAiCompatible {
    id: ProviderId,
    label: &'static str,
    url: &'static str,
    extra_headers: &'static [(&'static str, &'static str)],
    policy: ParsePolicy,
}

impl ProviderDescriptor for OpenAiCompatible {
    fn id(&self) -> ProviderId {
        self.id
    }

    fn label(&self) -> &str {
        self.label
    }

    fn build_request(
        &self,
        api_key: &str,
        model: &str,
        system_prompt: &str,
        user_prompt: &str,
    ) -> ApiRequest {
        let mut headers = json_headers();
        headers.push(bearer(api_key.trim()));
        headers.extend(
            self.extra_headers
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string())),
        );

        ApiRequest {
            url: self.url.to_string(),
            headers,
            body: json!({
                "model": model,
                "messages": [
                    { "role": "system", "content": system_prompt },
                    { "role": "user", "content": user_prompt }
                ],
                "temperature": 0.3
            }),
        }
    }

    fn parse_response(&self, data: &Value) -> Result<String, GenerationError> {
        if has_error(data) {
            return Err(GenerationError::Provider(
                error_detail(data).unwrap_or_default(),
            ));
        }
        chat_content(data)
            .map(|content| content.trim().to_string())
            .ok_or_else(|| {
                GenerationError::Format(format!("Unexpected response format from {}", self.label))
            })
    }

    fn parse_policy(&self) -> ParsePolicy {
        self.policy
    }
}

// =============================================================================
// Grok (x.ai)
// =============================================================================

pub struct GrokProvider;

impl ProviderDescriptor for GrokProvider {
    fn id(&self) -> ProviderId {
        ProviderId::Grok
    }

    fn label(&self) -> &str {
        "Grok (x.ai)"
    }

    fn build_request(
        &self,
        api_key: &str,
        model: &str,
        system_prompt: &str,
        user_prompt: &str,
    ) -> ApiRequest {
        let mut headers = json_headers();
        headers.push(bearer(api_key.trim()));

        ApiRequest {
            url: "https://api.x.ai/v1/chat/completions".to_string(),
            headers,
            body: json!({
                "messages": [
                    { "role": "system", "content": format!("{}{}", system_prompt, GROK_SYSTEM_SUFFIX) },
                    { "role": "user", "content": format!("{}{}", user_prompt, GROK_FORMAT_CHECKLIST) }
                ],
                "model": model,
                "stream": false,
                "temperature": 0.1,
                "max_tokens": 16000,
                "top_p": 0.1
            }),
        }
    }

    fn parse_response(&self, data: &Value) -> Result<String, GenerationError> {
        if has_error(data) {
            return Err(GenerationError::Provider(format!(
                "x.ai API Error: {}",
                error_detail(data).unwrap_or_default()
            )));
        }

        let choice = data
            .get("choices")
            .and_then(Value::as_array)
            .and_then(|choices| choices.first())
            .ok_or_else(|| {
                GenerationError::Format(
                    "Invalid x.ai response format: missing choices array".to_string(),
                )
            })?;

        let content = choice
            .pointer("/message/content")
            .and_then(Value::as_str)
            .filter(|content| !content.is_empty())
            .ok_or_else(|| {
                GenerationError::Format("Invalid x.ai response format: missing content".to_string())
            })?;

        if choice.get("finish_reason").and_then(Value::as_str) == Some("length") {
            warn!("x.ai response was truncated due to token limit");
        }
        if content.trim().len() < 50 {
            debug!(len = content.trim().len(), "x.ai response content is suspiciously short");
        }

        Ok(content.trim().to_string())
    }

    fn parse_policy(&self) -> ParsePolicy {
        ParsePolicy::Lenient
    }

    fn is_slow(&self) -> bool {
        true
    }

    fn error_prefix(&self) -> Option<&str> {
        Some("x.ai API Error: ")
    }
}

// =============================================================================
// Google Gemini
// =============================================================================

pub struct GeminiProvider;

impl ProviderDescriptor for GeminiProvider {
    fn id(&self) -> ProviderId {
        ProviderId::Gemini
    }

    fn label(&self) -> &str {
        "Google Gemini"
    }

    fn build_request(
        &self,
        api_key: &str,
        model: &str,
        system_prompt: &str,
        user_prompt: &str,
    ) -> ApiRequest {
        ApiRequest {
            url: format!(
                "https://generativelanguage.googleapis.com/v1beta/models/{}:generateContent?key={}",
                model,
                api_key.trim()
            ),
            headers: json_headers(),
            body: json!({
                "contents": [
                    {
                        "role": "user",
                        "parts": [{ "text": combined_prompt(system_prompt, user_prompt) }]
                    }
                ],
                "generationConfig": { "temperature": 0.3 }
            }),
        }
    }

    fn parse_response(&self, data: &Value) -> Result<String, GenerationError> {
        if has_error(data) {
            return Err(GenerationError::Provider(
                error_detail(data).unwrap_or_default(),
            ));
        }

        let text = data
            .pointer("/candidates/0/content/parts/0/text")
            .and_then(Value::as_str)
            .map(str::trim)
            .ok_or_else(|| {
                GenerationError::Format(format!("Unexpected response format from {}", self.label()))
            })?;

        if text.contains("```") {
            if let Some(inner) = FENCED_BLOCK.captures(text).and_then(|c| c.get(1)) {
                return Ok(inner.as_str().trim().to_string());
            }
        }
        Ok(text.to_string())
    }

    fn parse_policy(&self) -> ParsePolicy {
        ParsePolicy::Strict
    }
}

// =============================================================================
// Anthropic Claude
// =============================================================================

pub struct ClaudeProvider {
    auth_method: ClaudeAuthMethod,
}

impl ClaudeProvider {
    pub fn new(auth_method: ClaudeAuthMethod) -> Self {
        Self { auth_method }
    }
}

impl ProviderDescriptor for ClaudeProvider {
    fn id(&self) -> ProviderId {
        ProviderId::Claude
    }

    fn label(&self) -> &str {
        "Anthropic (Claude)"
    }

    fn build_request(
        &self,
        api_key: &str,
        model: &str,
        system_prompt: &str,
        user_prompt: &str,
    ) -> ApiRequest {
        let mut headers = json_headers();
        headers.push(self.auth_method.header(api_key.trim()));
        headers.push(("anthropic-version".to_string(), ANTHROPIC_VERSION.to_string()));
        headers.push((
            "anthropic-dangerous-direct-browser-access".to_string(),
            "true".to_string(),
        ));

        ApiRequest {
            url: "https://api.anthropic.com/v1/messages".to_string(),
            headers,
            body: json!({
                "model": model,
                "max_tokens": 4096,
                "messages": [
                    { "role": "user", "content": combined_prompt(system_prompt, user_prompt) }
                ],
                "temperature": 0.2
            }),
        }
    }

    fn parse_response(&self, data: &Value) -> Result<String, GenerationError> {
        if has_error(data) {
            return Err(GenerationError::Provider(format!(
                "Claude API Error: {}",
                error_detail(data).unwrap_or_default()
            )));
        }

        if let Some(blocks) = data.get("content").and_then(Value::as_array) {
            let texts: Vec<&str> = blocks
                .iter()
                .filter(|block| block.get("type").and_then(Value::as_str) == Some("text"))
                .filter_map(|block| block.get("text").and_then(Value::as_str))
                .collect();
            if !texts.is_empty() {
                return Ok(texts.join("\n").trim().to_string());
            }
        }

        // Legacy completion API
        if let Some(completion) = data.get("completion").and_then(Value::as_str) {
            return Ok(completion.trim().to_string());
        }

        Err(GenerationError::Format(
            "Unexpected response format from Claude API".to_string(),
        ))
    }

    fn parse_policy(&self) -> ParsePolicy {
        ParsePolicy::Lenient
    }

    fn error_prefix(&self) -> Option<&str> {
        Some("Claude API Error: ")
    }
}

// =============================================================================
// Registry
// =============================================================================

/// Static lookup of provider descriptors by id.
pub struct ProviderRegistry {
    providers: Vec<Box<dyn ProviderDescriptor>>,
}

impl ProviderRegistry {
    /// Builds the registry with the Claude header strategy resolved up front.
    pub fn new(claude_auth: ClaudeAuthMethod) -> Self {
        let providers: Vec<Box<dyn ProviderDescriptor>> = vec![
            Box::new(OpenAiCompatible {
                id: ProviderId::OpenAi,
                label: "OpenAI (GPT)",
                url: "https://api.openai.com/v1/chat/completions",
                extra_headers: &[],
                policy: ParsePolicy::Strict,
            }),
            Box::new(GeminiProvider),
            Box::new(OpenAiCompatible {
                id: ProviderId::Mistral,
                label: "Mistral AI",
                url: "https://api.mistral.ai/v1/chat/completions",
                extra_headers: &[],
                policy: ParsePolicy::Lenient,
            }),
            Box::new(ClaudeProvider::new(claude_auth)),
            Box::new(OpenAiCompatible {
                id: ProviderId::OpenRouter,
                label: "OpenRouter",
                url: "https://openrouter.ai/api/v1/chat/completions",
                extra_headers: &[("HTTP-Referer", OPENROUTER_REFERER), ("X-Title", OPENROUTER_TITLE)],
                policy: ParsePolicy::Strict,
            }),
            Box::new(GrokProvider),
            Box::new(OpenAiCompatible {
                id: ProviderId::Groq,
                label: "Groq",
                url: "https://api.groq.com/openai/v1/chat/completions",
                extra_headers: &[],
                policy: ParsePolicy::Strict,
            }),
        ];
        Self { providers }
    }

    pub fn get(&self, id: &str) -> Option<&dyn ProviderDescriptor> {
        let id = ProviderId::from_str(id).ok()?;
        self.get_by_id(id)
    }

    pub fn get_by_id(&self, id: ProviderId) -> Option<&dyn ProviderDescriptor> {
        self.providers
            .iter()
            .find(|p| p.id() == id)
            .map(|p| p.as_ref())
    }

    pub fn iter(&self) -> impl Iterator<Item = &dyn ProviderDescriptor> {
        self.providers.iter().map(|p| p.as_ref())
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new(ClaudeAuthMethod::default())
    }
}
