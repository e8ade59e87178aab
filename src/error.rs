//! Failure taxonomy for a single generation.
//!
//! Every way a generation can end badly is one variant of [`GenerationError`].
//! The orchestrator converts whatever it gets into the human-readable text
//! stored under `generationError`; nothing escapes as a process-level failure.

use std::time::Duration;
use thiserror::Error;

use crate::provider_registry::ProviderId;

/// Typed failure of a generation attempt sequence.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GenerationError {
    /// Missing or invalid provider, API key or model. Never retried.
    #[error("{0}")]
    Configuration(String),

    /// The request could not be sent or the response could not be read.
    #[error("{0}")]
    Transport(String),

    /// A single attempt exceeded its own timeout and was aborted.
    #[error("The request timed out after {secs} seconds. The service might be overloaded.")]
    TimedOut { secs: u64 },

    /// The overall generation deadline fired, regardless of retry state.
    #[error("Generation timed out after {limit}. The {label} API might be overloaded.")]
    OverallTimeout { label: String, limit: String },

    /// The provider answered with an explicit error payload.
    #[error("{0}")]
    Provider(String),

    /// The response shape was not recognized, or strict JSON parsing failed.
    #[error("{0}")]
    Format(String),

    /// Still overloaded after every allowed retry.
    #[error("{label} API still overloaded after {retries} retries. Please try again later.")]
    Overloaded { label: String, retries: u32 },

    /// The generation was cancelled by the user.
    #[error("Generation cancelled")]
    Cancelled,
}

impl GenerationError {
    pub fn overall_timeout(label: &str, limit: Duration) -> Self {
        Self::OverallTimeout {
            label: label.to_string(),
            limit: describe_duration(limit),
        }
    }

    /// True for the only error class eligible for retry.
    pub fn is_overloaded(&self) -> bool {
        match self {
            Self::Overloaded { .. } => true,
            Self::Provider(message) | Self::Transport(message) => {
                message.to_lowercase().contains("overloaded")
            }
            _ => false,
        }
    }

    /// Text shown to the user and stored as `generationError`.
    ///
    /// Adds provider-specific remediation hints. Classification is unaffected.
    pub fn user_message(&self, provider: Option<ProviderId>) -> String {
        let message = self.to_string();
        match self {
            Self::Provider(_) | Self::Transport(_) | Self::Format(_) => {}
            _ => return message,
        }

        if message.to_lowercase().contains("overloaded") {
            return "The AI service is currently overloaded with requests. Please wait a few minutes and try again later.".to_string();
        }

        match provider {
            Some(ProviderId::Grok) => grok_hint(&message).unwrap_or(message),
            Some(ProviderId::Claude)
                if message.contains("CORS")
                    || message.contains("anthropic-dangerous-direct-browser-access") =>
            {
                "CORS Error: Claude API requires the 'anthropic-dangerous-direct-browser-access' header. Please try again.".to_string()
            }
            _ => message,
        }
    }
}

fn grok_hint(message: &str) -> Option<String> {
    let hint = if message.contains("Invalid API Key") {
        "Invalid x.ai API Key: Please make sure your key starts with \"xai-\" and is complete. \
         Note that Grok/x.ai is a paid service - verify your account has an active subscription or sufficient credits."
    } else if message.contains("not found") || message.contains("404") {
        "x.ai API Error: The model or endpoint was not found. Try using \"grok-3-latest\" as the model."
    } else if message.contains("Rate limit") {
        "x.ai API Rate Limit: Your account has exceeded its request quota. Please try again later."
    } else if message.contains("missing choices") {
        "x.ai API Error: Response format issue. Please verify your account status and API key validity."
    } else if message.contains("missing content") {
        "x.ai API Error: Response content issue. Please verify your API key has proper access to the model."
    } else if message.contains("context length") {
        "x.ai API Error: The workflow is too large for x.ai to handle. Try simplifying your prompt or use a different provider."
    } else {
        return None;
    };
    Some(hint.to_string())
}

/// "3 minutes", "1 minute", "90 seconds".
pub fn describe_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    if secs >= 60 && secs % 60 == 0 {
        let minutes = secs / 60;
        if minutes == 1 {
            "1 minute".to_string()
        } else {
            format!("{} minutes", minutes)
        }
    } else {
        format!("{} seconds", secs)
    }
}
