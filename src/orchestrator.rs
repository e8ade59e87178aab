//! Background generation orchestrator.
//!
//! Accepts start/clear/cancel commands, acknowledges them immediately, and
//! runs each generation as a detached task that outlives the caller. All
//! state goes through the [`StateStore`]; observers reattach by reading it.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::clock::{Sleeper, SystemTimeProvider, TimeProvider, TokioSleeper};
use crate::config::GenerationSettings;
use crate::error::GenerationError;
use crate::history::HistoryEntry;
use crate::http_client::HttpClient;
use crate::normalizer::normalize;
use crate::notify::{Notification, NotificationSink};
use crate::provider_registry::{ProviderDescriptor, ProviderRegistry};
use crate::retry::RetryController;
use crate::state::{GenerationState, StateStore};

const EXTERNAL_CHANGE_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Inputs of one generation, as sent by a settings surface.
#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationRequest {
    pub provider_id: String,
    pub api_key: String,
    pub model: String,
    pub user_prompt: String,
    pub system_prompt: String,
}

impl fmt::Debug for GenerationRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GenerationRequest")
            .field("provider_id", &self.provider_id)
            .field("model", &self.model)
            .field("user_prompt", &self.user_prompt)
            .finish_non_exhaustive()
    }
}

/// Commands accepted by the orchestrator, tagged by `action` on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum Command {
    StartBackgroundGeneration(GenerationRequest),
    ClearGenerationData,
    CancelGeneration,
}

/// Immediate reply to a [`Command`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Ack {
    fn ok(message: Option<&str>) -> Self {
        Self {
            success: true,
            message: message.map(str::to_string),
        }
    }

    fn failed(message: String) -> Self {
        Self {
            success: false,
            message: Some(message),
        }
    }
}

struct ActiveGeneration {
    id: u64,
    cancel: CancellationToken,
}

/// Everything a background task needs, shared with the orchestrator.
#[derive(Clone)]
struct Services {
    store: Arc<StateStore>,
    http: Arc<dyn HttpClient>,
    notifier: Arc<dyn NotificationSink>,
    time: Arc<dyn TimeProvider>,
    sleeper: Arc<dyn Sleeper>,
    settings: GenerationSettings,
    active: Arc<Mutex<Option<ActiveGeneration>>>,
}

pub struct Orchestrator {
    services: Services,
}

impl Orchestrator {
    pub fn new(
        store: Arc<StateStore>,
        http: Arc<dyn HttpClient>,
        notifier: Arc<dyn NotificationSink>,
        settings: GenerationSettings,
    ) -> Self {
        Self {
            services: Services {
                store,
                http,
                notifier,
                time: Arc::new(SystemTimeProvider),
                sleeper: Arc::new(TokioSleeper),
                settings,
                active: Arc::new(Mutex::new(None)),
            },
        }
    }

    pub fn with_time_provider(mut self, time: Arc<dyn TimeProvider>) -> Self {
        self.services.time = time;
        self
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.services.sleeper = sleeper;
        self
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.services.store
    }

    /// Handles one command. Must be called from within a Tokio runtime.
    ///
    /// Returns before any network I/O; the generation itself continues in
    /// the background.
    pub fn handle(&self, command: Command) -> Ack {
        match command {
            Command::StartBackgroundGeneration(request) => self.start(request),
            Command::ClearGenerationData => {
                self.abort_active();
                self.services.store.clear();
                info!("Generation data cleared");
                Ack::ok(None)
            }
            Command::CancelGeneration => {
                self.abort_active();
                if self.services.store.cancel() {
                    info!("Generation cancelled");
                    self.services
                        .notifier
                        .notify(&Notification::error(&GenerationError::Cancelled.to_string()));
                }
                Ack::ok(None)
            }
        }
    }

    /// Resolves once the store reports a finished generation and returns it.
    ///
    /// The state file is polled as well, so a cancel or clear written by
    /// another process also ends the wait and aborts the in-flight request.
    pub async fn wait_for_completion(&self) -> GenerationState {
        let store = &self.services.store;
        let mut events = store.subscribe();
        let mut poll = tokio::time::interval(EXTERNAL_CHANGE_POLL_INTERVAL);

        let state = loop {
            let state = store.state();
            if !state.generation_in_progress {
                break state;
            }
            tokio::select! {
                event = events.recv() => match event {
                    Ok(state) if !state.generation_in_progress => break state,
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => break store.state(),
                },
                _ = poll.tick() => {
                    let state = store.refresh();
                    if !state.generation_in_progress {
                        break state;
                    }
                }
            }
        };

        // No-op when the task already finished on its own.
        self.abort_active();
        state
    }

    fn start(&self, request: GenerationRequest) -> Ack {
        let services = &self.services;
        info!(
            "Starting background generation with {} ({})",
            request.provider_id, request.model
        );

        // The auth strategy learned by the probe is fixed for this generation.
        let registry = ProviderRegistry::new(services.store.claude_auth_method());

        let id = match services.store.begin(&request.user_prompt) {
            Ok(id) => id,
            Err(e) => {
                warn!("Rejected start: {}", e);
                return Ack::failed(e.to_string());
            }
        };

        if registry.get(&request.provider_id).is_none() {
            let message = format!("Invalid provider: {}", request.provider_id);
            error!("{}", message);
            if services.store.finish(id, Err(message.clone())) {
                services.notifier.notify(&Notification::error(&message));
            }
            return Ack::failed(message);
        }

        let cancel = CancellationToken::new();
        let (ack_tx, ack_rx) = oneshot::channel();
        tokio::spawn(run_generation(
            services.clone(),
            id,
            request,
            registry,
            cancel.clone(),
            ack_rx,
        ));
        set_active(&services.active, Some(ActiveGeneration { id, cancel }));

        // The task waits on this so the active slot is set before it runs.
        let _ = ack_tx.send(());
        Ack::ok(Some("Generation started in background"))
    }

    fn abort_active(&self) {
        if let Some(active) = set_active(&self.services.active, None) {
            debug!(generation = active.id, "Cancelling in-flight generation");
            active.cancel.cancel();
        }
    }
}

fn set_active(
    slot: &Mutex<Option<ActiveGeneration>>,
    value: Option<ActiveGeneration>,
) -> Option<ActiveGeneration> {
    let mut slot = slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    std::mem::replace(&mut *slot, value)
}

async fn run_generation(
    services: Services,
    id: u64,
    request: GenerationRequest,
    registry: ProviderRegistry,
    cancel: CancellationToken,
    ack: oneshot::Receiver<()>,
) {
    if ack.await.is_err() {
        return;
    }
    let Some(provider) = registry.get(&request.provider_id) else {
        return;
    };

    let policy = services.settings.policy_for(provider);
    let max_generation = policy.max_generation;
    let controller = RetryController::new(provider.label(), policy).with_sleeper(services.sleeper.clone());

    let outcome = match validate(provider, &request) {
        Ok(()) => {
            let api_request = provider.build_request(
                &request.api_key,
                &request.model,
                &request.system_prompt,
                &request.user_prompt,
            );
            debug!(?api_request, "Built provider request");
            let api_request = &api_request;
            let http = &services.http;
            let store = &services.store;
            controller
                .execute(
                    || async move {
                        let response = http
                            .post_json(&api_request.url, &api_request.header_pairs(), &api_request.body)
                            .await
                            .map_err(|e| GenerationError::Transport(format!("Network error: {}", e)))?;
                        provider.parse_body(&response)
                    },
                    &cancel,
                    |status| store.set_status(id, status),
                )
                .await
                .and_then(|text| normalize(&text, provider))
        }
        Err(e) => Err(e),
    };

    match outcome {
        Ok(json) => {
            if services.store.finish(id, Ok(json.clone())) {
                info!("{} generation complete", provider.label());
                let entry = HistoryEntry::new(&request.user_prompt, &json, provider.id(), services.time.as_ref());
                services.store.append_history(entry);
                services.notifier.notify(&Notification::success(provider.label()));
            } else {
                debug!(generation = id, "Result arrived after generation ended, discarded");
            }
        }
        Err(err) => {
            let message = err.user_message(Some(provider.id()));
            if services.store.finish(id, Err(message.clone())) {
                error!("{} generation failed: {}", provider.label(), message);
                services.notifier.notify(&Notification::for_failure(
                    &err,
                    provider.label(),
                    max_generation,
                    &message,
                ));
            } else {
                debug!(generation = id, "Error arrived after generation ended, discarded: {}", err);
            }
        }
    }

    let mut slot = services.active.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    if slot.as_ref().is_some_and(|active| active.id == id) {
        *slot = None;
    }
}

fn validate(provider: &dyn ProviderDescriptor, request: &GenerationRequest) -> Result<(), GenerationError> {
    if request.api_key.trim().is_empty() {
        return Err(GenerationError::Configuration(format!(
            "API key for {} is missing. Please add it in the settings.",
            provider.label()
        )));
    }
    if request.model.trim().is_empty() {
        return Err(GenerationError::Configuration(format!(
            "No model selected for {}. Please choose a model in the settings.",
            provider.label()
        )));
    }
    Ok(())
}
