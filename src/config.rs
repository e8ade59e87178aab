use anyhow::{anyhow, Result};
use dirs::home_dir;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use crate::provider_registry::{ProviderDescriptor, ProviderId};
use crate::retry::{self, RetryPolicy};

pub const DEFAULT_SYSTEM_PROMPT: &str = r#"You are an expert n8n workflow designer. Turn the user's description into a complete n8n workflow that can be imported directly into n8n.

Respond with a single JSON object and nothing else: no markdown fences, no explanations before or after it.

The object must contain:
- "name": a short descriptive workflow name
- "nodes": an array of nodes, each with "id", "name", "type" (for example "n8n-nodes-base.webhook"), "typeVersion", "position" as [x, y] and "parameters"
- "connections": an object keyed by source node name, mapping "main" to arrays of {"node", "type": "main", "index"} targets
- "settings": an object, may be empty

Start every workflow with a trigger node. Give every node a unique name, lay nodes out left to right about 200 units apart, and connect each node to the next step of the flow. Use credentials placeholders instead of real secrets."#;

/// Credentials and model for one provider.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct ProviderSettings {
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
}

impl fmt::Debug for ProviderSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderSettings")
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("model", &self.model)
            .finish()
    }
}

/// Timeouts and retry limits, in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationSettings {
    pub attempt_timeout_secs: u64,
    pub slow_attempt_timeout_secs: u64,
    pub max_generation_secs: u64,
    pub max_retries: u32,
    pub status_interval_secs: u64,
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            attempt_timeout_secs: retry::DEFAULT_ATTEMPT_TIMEOUT.as_secs(),
            slow_attempt_timeout_secs: retry::SLOW_ATTEMPT_TIMEOUT.as_secs(),
            max_generation_secs: retry::DEFAULT_MAX_GENERATION.as_secs(),
            max_retries: retry::DEFAULT_MAX_RETRIES,
            status_interval_secs: retry::DEFAULT_STATUS_INTERVAL.as_secs(),
        }
    }
}

impl GenerationSettings {
    /// Retry policy for `provider`; slow providers get the longer attempt timeout.
    pub fn policy_for(&self, provider: &dyn ProviderDescriptor) -> RetryPolicy {
        let attempt_secs = if provider.is_slow() {
            self.slow_attempt_timeout_secs
        } else {
            self.attempt_timeout_secs
        };
        RetryPolicy {
            attempt_timeout: Duration::from_secs(attempt_secs),
            max_generation: Duration::from_secs(self.max_generation_secs),
            max_retries: self.max_retries,
            status_interval: Duration::from_secs(self.status_interval_secs.max(1)),
            ..RetryPolicy::default()
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub generation: GenerationSettings,
    #[serde(default)]
    pub providers: BTreeMap<String, ProviderSettings>,
}

impl Config {
    /// Load configuration from file, then apply environment overrides
    pub fn load() -> Result<Self> {
        let config_path = Self::get_config_path()?;
        let mut config = Self::load_from_file(&config_path).unwrap_or_else(|_| {
            info!("No config file found, using defaults");
            Self::default()
        });

        // Environment variables override config file
        for id in ProviderId::ALL {
            if let Ok(api_key) = std::env::var(api_key_env_var(id)) {
                config.entry(id).api_key = Some(api_key);
            }
        }
        if let Ok(provider) = std::env::var("FLOWGEN_PROVIDER") {
            config.provider = Some(provider);
        }

        Ok(config)
    }

    pub fn load_from_file(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = fs::read_to_string(path)?;
            let config: Config = toml::from_str(&content)?;
            info!("Loaded config from: {}", path.display());
            Ok(config)
        } else {
            Err(anyhow!("Config file not found"))
        }
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::get_config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        // Create parent directory if it doesn't exist
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        info!("Saved config to: {}", path.display());
        Ok(())
    }

    /// `$FLOWGEN_HOME`, or `~/.flowgen`.
    pub fn get_config_dir() -> Result<PathBuf> {
        if let Ok(dir) = std::env::var("FLOWGEN_HOME") {
            return Ok(PathBuf::from(dir));
        }
        let home = home_dir().ok_or_else(|| anyhow!("Could not find home directory"))?;
        Ok(home.join(".flowgen"))
    }

    pub fn get_config_path() -> Result<PathBuf> {
        Ok(Self::get_config_dir()?.join("config.toml"))
    }

    /// Location of the persisted generation state.
    pub fn get_state_path() -> Result<PathBuf> {
        Ok(Self::get_config_dir()?.join("state.json"))
    }

    fn entry(&mut self, id: ProviderId) -> &mut ProviderSettings {
        self.providers.entry(id.as_str().to_string()).or_default()
    }

    /// The selected provider id; "openai" when none is configured.
    pub fn provider(&self) -> &str {
        self.provider.as_deref().unwrap_or(ProviderId::OpenAi.as_str())
    }

    pub fn api_key(&self, id: ProviderId) -> Option<&str> {
        self.providers
            .get(id.as_str())
            .and_then(|settings| settings.api_key.as_deref())
    }

    pub fn model(&self, id: ProviderId) -> Option<&str> {
        self.providers
            .get(id.as_str())
            .and_then(|settings| settings.model.as_deref())
    }

    pub fn system_prompt(&self) -> &str {
        self.system_prompt.as_deref().unwrap_or(DEFAULT_SYSTEM_PROMPT)
    }

    /// Set API key for `id` and save config
    pub fn set_api_key(&mut self, id: ProviderId, api_key: String) -> Result<()> {
        self.entry(id).api_key = Some(api_key);
        self.save()?;
        info!("API key for {} saved to config file", id);
        Ok(())
    }

    /// Set model for `id`, select the provider and save config
    pub fn set_model(&mut self, id: ProviderId, model: String) -> Result<()> {
        self.entry(id).model = Some(model);
        self.provider = Some(id.as_str().to_string());
        self.save()?;
        info!("Model for {} saved to config file", id);
        Ok(())
    }

    pub fn show_config_info() -> Result<()> {
        let config_path = Self::get_config_path()?;
        println!("Configuration file: {}", config_path.display());
        println!("State file: {}", Self::get_state_path()?.display());

        let config = if config_path.exists() {
            println!("Status: Found");
            Self::load_from_file(&config_path)?
        } else {
            println!("Status: Not found (using defaults)");
            Self::default()
        };

        println!("Provider: {}", config.provider());
        for id in ProviderId::ALL {
            println!(
                "  {:<11} key: {:<8} model: {}",
                id.as_str(),
                if config.api_key(id).is_some() { "Set" } else { "Not set" },
                config.model(id).unwrap_or("-")
            );
        }
        println!(
            "Timeouts: attempt {}s (slow {}s), overall {}s, {} retries",
            config.generation.attempt_timeout_secs,
            config.generation.slow_attempt_timeout_secs,
            config.generation.max_generation_secs,
            config.generation.max_retries
        );

        println!("\nTo set an API key and model:");
        println!("  flowgen set-key <provider> <your-key>");
        println!("  flowgen set-model <provider> <model>");
        println!("\nOr set environment variables, e.g.:");
        println!("  export ANTHROPIC_API_KEY=<your-key>");

        Ok(())
    }
}

/// Environment variable that overrides the API key of `id`.
pub fn api_key_env_var(id: ProviderId) -> &'static str {
    match id {
        ProviderId::OpenAi => "OPENAI_API_KEY",
        ProviderId::Gemini => "GEMINI_API_KEY",
        ProviderId::Mistral => "MISTRAL_API_KEY",
        ProviderId::Claude => "ANTHROPIC_API_KEY",
        ProviderId::OpenRouter => "OPENROUTER_API_KEY",
        ProviderId::Grok => "XAI_API_KEY",
        ProviderId::Groq => "GROQ_API_KEY",
    }
}
