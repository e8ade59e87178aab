//! Flowgen - background generation of n8n workflow JSON with LLM providers.
//!
//! This library turns a natural-language description into an importable n8n
//! workflow. It supports:
//!
//! - **Seven providers** (OpenAI, Gemini, Mistral, Claude, OpenRouter, Grok,
//!   Groq) behind one request/response contract
//! - **Background generation** that keeps running after the caller goes away
//! - **Retry with backoff** for overloaded services, under hard timeouts
//! - **Persisted state** that any observer can re-read to pick up the result
//! - **History** of the last successful generations
//!
//! # Architecture
//!
//! - [`config`] - Configuration management (API keys, models, timeouts)
//! - [`provider_registry`] - Per-provider request building and response parsing
//! - [`normalizer`] - Turns raw model output into clean, pretty-printed JSON
//! - [`retry`] - Per-attempt timeouts, overall deadline, backoff, cancellation
//! - [`orchestrator`] - Accepts commands and runs generations in the background
//! - [`state`] - Persisted generation state with change subscriptions
//! - [`history`] - Bounded log of successful generations
//! - [`notify`] - Notifications and the status badge
//! - [`probe`] - Detects the Claude authentication header that works
//! - [`error`] - Generation error taxonomy
//! - [`clock`] - Shared dependency injection traits for time and sleeping
//! - [`http_client`] - HTTP client abstraction
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use flowgen::config::Config;
//! use flowgen::http_client::ReqwestHttpClient;
//! use flowgen::notify::ConsoleNotifier;
//! use flowgen::orchestrator::{Command, GenerationRequest, Orchestrator};
//! use flowgen::state::StateStore;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load()?;
//!     let store = Arc::new(StateStore::open(Config::get_state_path()?)?);
//!     let orchestrator = Orchestrator::new(
//!         store,
//!         Arc::new(ReqwestHttpClient::new()),
//!         Arc::new(ConsoleNotifier),
//!         config.generation.clone(),
//!     );
//!
//!     let ack = orchestrator.handle(Command::StartBackgroundGeneration(GenerationRequest {
//!         provider_id: "claude".to_string(),
//!         api_key: "sk-ant-...".to_string(),
//!         model: "claude-3-5-sonnet-20241022".to_string(),
//!         user_prompt: "Post new GitHub issues to Slack".to_string(),
//!         system_prompt: config.system_prompt().to_string(),
//!     }));
//!     assert!(ack.success);
//!
//!     let state = orchestrator.wait_for_completion().await;
//!     println!("{}", state.generated_json.unwrap_or_default());
//!     Ok(())
//! }
//! ```
//!
//! # Observing from another process
//!
//! The state file is the hand-off point. A process that did not start the
//! generation reads it with [`state::StateStore::read_snapshot`]:
//!
//! ```bash
//! flowgen generate "Send a daily weather report by email" &
//! flowgen watch
//! flowgen status
//! ```

pub mod clock;
pub mod config;
pub mod error;
pub mod history;
pub mod http_client;
pub mod normalizer;
pub mod notify;
pub mod orchestrator;
pub mod probe;
pub mod provider_registry;
pub mod retry;
pub mod state;
