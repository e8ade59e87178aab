use anyhow::Result;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::process::Command as Process;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

use flowgen::config::GenerationSettings;
use flowgen::history::MAX_HISTORY_ENTRIES;
use flowgen::http_client::{HttpClient, HttpResponse};
use flowgen::notify::{Notification, NotificationKind, NotificationSink};
use flowgen::orchestrator::{Command, GenerationRequest, Orchestrator};
use flowgen::state::{Phase, StateStore};

/// Replays canned responses; `None` never answers.
struct CannedHttpClient {
    responses: Mutex<VecDeque<Option<HttpResponse>>>,
    calls: Mutex<u32>,
}

impl CannedHttpClient {
    fn new(responses: Vec<Option<HttpResponse>>) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses.into()),
            calls: Mutex::new(0),
        })
    }

    fn calls(&self) -> u32 {
        *self.calls.lock().unwrap()
    }
}

#[async_trait]
impl HttpClient for CannedHttpClient {
    async fn post_json(
        &self,
        _url: &str,
        _headers: &[(&str, &str)],
        _body: &serde_json::Value,
    ) -> Result<HttpResponse> {
        *self.calls.lock().unwrap() += 1;
        let next = {
            let mut responses = self.responses.lock().unwrap();
            if responses.len() > 1 {
                responses.pop_front().flatten()
            } else {
                responses.front().cloned().flatten()
            }
        };
        match next {
            Some(response) => Ok(response),
            None => std::future::pending().await,
        }
    }

    async fn get(&self, _url: &str, _headers: &[(&str, &str)]) -> Result<HttpResponse> {
        anyhow::bail!("GET not expected")
    }
}

#[derive(Default)]
struct CollectingNotifier(Mutex<Vec<Notification>>);

impl NotificationSink for CollectingNotifier {
    fn notify(&self, notification: &Notification) {
        self.0.lock().unwrap().push(notification.clone());
    }
}

fn request(provider: &str, prompt: &str) -> Command {
    Command::StartBackgroundGeneration(GenerationRequest {
        provider_id: provider.to_string(),
        api_key: "integration-key".to_string(),
        model: "integration-model".to_string(),
        user_prompt: prompt.to_string(),
        system_prompt: "Return an n8n workflow as JSON".to_string(),
    })
}

fn openai_body(content: &str) -> HttpResponse {
    let body = serde_json::json!({"choices": [{"message": {"content": content}}]});
    HttpResponse::new(200, body.to_string())
}

#[tokio::test]
async fn test_result_survives_in_state_file() -> Result<()> {
    let dir = TempDir::new()?;
    let path = dir.path().join("state.json");
    let http = CannedHttpClient::new(vec![Some(openai_body("```json\n{\"name\":\"Flow\",\"nodes\":[]}\n```"))]);
    let notifier = Arc::new(CollectingNotifier::default());

    {
        let orchestrator = Orchestrator::new(
            Arc::new(StateStore::open(&path)?),
            http.clone(),
            notifier.clone(),
            GenerationSettings::default(),
        );
        let ack = orchestrator.handle(request("openai", "Create a webhook flow"));
        assert!(ack.success);
        orchestrator.wait_for_completion().await;
    }

    // An observer that never saw the start reads the outcome from disk.
    let doc = StateStore::read_snapshot(&path)?;
    assert_eq!(doc.generation.phase(), Phase::Succeeded);
    assert_eq!(
        doc.generation.generated_json.as_deref(),
        Some("{\n  \"name\": \"Flow\",\n  \"nodes\": []\n}")
    );
    assert_eq!(doc.current_prompt, "Create a webhook flow");
    assert_eq!(doc.generation_history.len(), 1);

    let notifications = notifier.0.lock().unwrap().clone();
    assert_eq!(notifications.len(), 1);
    assert_eq!(notifications[0].kind, NotificationKind::Success);
    assert_eq!(http.calls(), 1);

    Ok(())
}

#[tokio::test]
async fn test_history_keeps_latest_twenty() -> Result<()> {
    let dir = TempDir::new()?;
    let path = dir.path().join("state.json");
    let http = CannedHttpClient::new(vec![Some(openai_body("{}"))]);
    let orchestrator = Orchestrator::new(
        Arc::new(StateStore::open(&path)?),
        http,
        Arc::new(CollectingNotifier::default()),
        GenerationSettings::default(),
    );

    for n in 1..=25 {
        assert!(orchestrator.handle(request("groq", &format!("prompt {}", n))).success);
        orchestrator.wait_for_completion().await;
    }

    let history = StateStore::read_snapshot(&path)?.generation_history;
    assert_eq!(history.len(), MAX_HISTORY_ENTRIES);
    let prompts: Vec<&str> = history.list().iter().map(|e| e.prompt.as_str()).collect();
    assert_eq!(prompts.first(), Some(&"prompt 25"));
    assert_eq!(prompts.last(), Some(&"prompt 6"));

    Ok(())
}

#[tokio::test]
async fn test_strict_provider_rejects_invalid_json() -> Result<()> {
    let http = CannedHttpClient::new(vec![Some(openai_body("{\"nodes\": [,]}"))]);
    let orchestrator = Orchestrator::new(
        Arc::new(StateStore::in_memory()),
        http,
        Arc::new(CollectingNotifier::default()),
        GenerationSettings::default(),
    );

    orchestrator.handle(request("openai", "p"));
    let state = orchestrator.wait_for_completion().await;
    assert_eq!(state.phase(), Phase::Failed);
    assert!(state.generated_json.is_none());
    assert!(state
        .generation_error
        .as_deref()
        .is_some_and(|e| e.starts_with("Invalid JSON response")));
    assert!(orchestrator.store().history().is_empty());

    Ok(())
}

#[tokio::test]
async fn test_attempt_timeout_is_reported() -> Result<()> {
    let http = CannedHttpClient::new(vec![None]);
    let settings = GenerationSettings {
        attempt_timeout_secs: 1,
        max_generation_secs: 30,
        ..GenerationSettings::default()
    };
    let orchestrator = Orchestrator::new(
        Arc::new(StateStore::in_memory()),
        http.clone(),
        Arc::new(CollectingNotifier::default()),
        settings,
    );

    orchestrator.handle(request("mistral", "p"));
    let state = tokio::time::timeout(Duration::from_secs(10), orchestrator.wait_for_completion()).await?;
    assert_eq!(
        state.generation_error.as_deref(),
        Some("The request timed out after 1 seconds. The service might be overloaded.")
    );
    assert_eq!(http.calls(), 1);

    Ok(())
}

#[tokio::test]
async fn test_cancel_then_restart() -> Result<()> {
    let http = CannedHttpClient::new(vec![None, Some(openai_body("{\"ok\":true}"))]);
    let orchestrator = Orchestrator::new(
        Arc::new(StateStore::in_memory()),
        http,
        Arc::new(CollectingNotifier::default()),
        GenerationSettings::default(),
    );

    assert!(orchestrator.handle(request("openrouter", "first")).success);
    tokio::task::yield_now().await;
    assert!(orchestrator.handle(Command::CancelGeneration).success);
    let cancelled = orchestrator.wait_for_completion().await;
    assert_eq!(cancelled.generation_error.as_deref(), Some("Generation cancelled"));

    assert!(orchestrator.handle(request("openrouter", "second")).success);
    let state = orchestrator.wait_for_completion().await;
    assert_eq!(state.generated_json.as_deref(), Some("{\n  \"ok\": true\n}"));

    Ok(())
}

#[tokio::test]
async fn test_cancel_from_another_process_ends_wait() -> Result<()> {
    let dir = TempDir::new()?;
    let path = dir.path().join("state.json");
    let http = CannedHttpClient::new(vec![None, Some(openai_body("{}"))]);
    let notifier = Arc::new(CollectingNotifier::default());
    let orchestrator = Orchestrator::new(
        Arc::new(StateStore::open(&path)?),
        http.clone(),
        notifier.clone(),
        GenerationSettings::default(),
    );

    assert!(orchestrator.handle(request("openai", "p")).success);
    tokio::task::yield_now().await;

    // Same as `flowgen cancel` run from another shell.
    assert!(StateStore::open(&path)?.cancel());

    let state = tokio::time::timeout(Duration::from_secs(3), orchestrator.wait_for_completion()).await?;
    assert_eq!(state.generation_error.as_deref(), Some("Generation cancelled"));
    assert!(state.generated_json.is_none());
    assert!(notifier.0.lock().unwrap().is_empty());

    // The store is free again for a new generation.
    assert!(orchestrator.handle(request("openai", "again")).success);
    let state = tokio::time::timeout(Duration::from_secs(3), orchestrator.wait_for_completion()).await?;
    assert_eq!(state.generated_json.as_deref(), Some("{}"));

    Ok(())
}

// ============================================================================
// CLI
// ============================================================================

fn run_flowgen(home: &TempDir, args: &[&str]) -> Result<std::process::Output> {
    let output = Process::new(env!("CARGO_BIN_EXE_flowgen"))
        .args(args)
        .env("FLOWGEN_HOME", home.path())
        .output()?;
    Ok(output)
}

#[test]
fn test_cli_status_without_state() -> Result<()> {
    let home = TempDir::new()?;
    let output = run_flowgen(&home, &["status"])?;

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("No generation yet"), "Stdout: {}", stdout);

    Ok(())
}

#[test]
fn test_cli_reads_state_written_by_library() -> Result<()> {
    let home = TempDir::new()?;
    let store = StateStore::open(home.path().join("state.json"))?;
    let id = store.begin("daily report")?;
    store.finish(id, Err("Generation cancelled".to_string()));

    let output = run_flowgen(&home, &["status"])?;
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("[!] Failed: Generation cancelled"), "Stdout: {}", stdout);
    assert!(stdout.contains("Prompt: daily report"), "Stdout: {}", stdout);

    let output = run_flowgen(&home, &["clear"])?;
    assert!(output.status.success());
    let doc = StateStore::read_snapshot(&home.path().join("state.json"))?;
    assert_eq!(doc.generation.phase(), Phase::Idle);

    Ok(())
}

#[test]
fn test_cli_rejects_unknown_provider_for_set_key() -> Result<()> {
    let home = TempDir::new()?;
    let output = run_flowgen(&home, &["set-key", "nope", "abc"])?;

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Invalid provider: nope"), "Stderr: {}", stderr);

    Ok(())
}

#[test]
fn test_cli_set_model_writes_config() -> Result<()> {
    let home = TempDir::new()?;
    let output = run_flowgen(&home, &["set-model", "grok", "grok-3-latest"])?;
    assert!(output.status.success());

    let content = std::fs::read_to_string(home.path().join("config.toml"))?;
    assert!(content.contains("grok-3-latest"));
    assert!(content.contains("provider = \"grok\""));

    Ok(())
}
