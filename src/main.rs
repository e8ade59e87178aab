use anyhow::{anyhow, Result};
use clap::{Arg, ArgMatches, Command};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

use flowgen::config::Config;
use flowgen::http_client::ReqwestHttpClient;
use flowgen::notify::{Badge, ConsoleNotifier};
use flowgen::orchestrator::{Command as GenerationCommand, GenerationRequest, Orchestrator};
use flowgen::probe::probe_claude_auth;
use flowgen::provider_registry::ProviderId;
use flowgen::state::{GenerationState, Phase, StateStore};

const WATCH_POLL_INTERVAL: Duration = Duration::from_millis(500);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let matches = cli().get_matches();

    match matches.subcommand() {
        Some(("generate", args)) => generate(args).await,
        Some(("status", _)) => status(),
        Some(("watch", _)) => watch().await,
        Some(("clear", _)) => {
            let store = StateStore::open(Config::get_state_path()?)?;
            store.clear();
            println!("✅ Generation data cleared");
            Ok(())
        }
        Some(("cancel", _)) => {
            let store = StateStore::open(Config::get_state_path()?)?;
            if store.cancel() {
                println!("✅ Generation cancelled");
            } else {
                println!("No generation in progress");
            }
            Ok(())
        }
        Some(("history", args)) => history(args),
        Some(("probe-claude", args)) => probe(args).await,
        Some(("set-key", args)) => {
            let id = provider_arg(args)?;
            let mut config = Config::load()?;
            config.set_api_key(id, required(args, "value")?.to_string())?;
            println!("✅ API key for {} saved successfully", id);
            Ok(())
        }
        Some(("set-model", args)) => {
            let id = provider_arg(args)?;
            let mut config = Config::load()?;
            config.set_model(id, required(args, "value")?.to_string())?;
            println!("✅ Model for {} saved, {} is now the selected provider", id, id);
            Ok(())
        }
        Some(("config", _)) => Config::show_config_info(),
        _ => unreachable!("clap requires a subcommand"),
    }
}

fn cli() -> Command {
    let provider = Arg::new("provider")
        .help("Provider id: openai, gemini, mistral, claude, openrouter, grok, groq")
        .required(true);

    Command::new("flowgen")
        .about("Generate n8n workflow JSON with an LLM provider in the background")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .subcommand(
            Command::new("generate")
                .about("Generate a workflow from a description and print the JSON")
                .arg(Arg::new("prompt")
                    .help("Description of the workflow")
                    .required(true)
                    .num_args(1..))
                .arg(Arg::new("provider")
                    .long("provider")
                    .short('p')
                    .help("Provider id (defaults to the configured provider)")
                    .num_args(1))
                .arg(Arg::new("model")
                    .long("model")
                    .short('m')
                    .help("Model name (defaults to the configured model)")
                    .num_args(1))
                .arg(Arg::new("api-key")
                    .long("api-key")
                    .help("API key (defaults to config or environment)")
                    .num_args(1)),
        )
        .subcommand(Command::new("status").about("Show the state of the current or last generation"))
        .subcommand(Command::new("watch").about("Follow a running generation until it finishes"))
        .subcommand(Command::new("clear").about("Reset generation state and the current prompt"))
        .subcommand(Command::new("cancel").about("Cancel the running generation"))
        .subcommand(
            Command::new("history")
                .about("Browse past successful generations")
                .subcommand_required(true)
                .subcommand(Command::new("list").about("List entries, newest first"))
                .subcommand(
                    Command::new("show")
                        .about("Print the JSON of one entry")
                        .arg(Arg::new("id").required(true).value_parser(clap::value_parser!(i64))),
                )
                .subcommand(
                    Command::new("remove")
                        .about("Delete one entry")
                        .arg(Arg::new("id").required(true).value_parser(clap::value_parser!(i64))),
                ),
        )
        .subcommand(
            Command::new("probe-claude")
                .about("Detect which authentication header the Claude API accepts")
                .arg(Arg::new("api-key")
                    .long("api-key")
                    .help("Claude API key (defaults to config or ANTHROPIC_API_KEY)")
                    .num_args(1)),
        )
        .subcommand(
            Command::new("set-key")
                .about("Save the API key of a provider")
                .arg(provider.clone())
                .arg(Arg::new("value").help("API key").required(true)),
        )
        .subcommand(
            Command::new("set-model")
                .about("Save the model of a provider and select it")
                .arg(provider)
                .arg(Arg::new("value").help("Model name").required(true)),
        )
        .subcommand(Command::new("config").about("Show configuration information"))
}

fn required<'a>(args: &'a ArgMatches, name: &str) -> Result<&'a str> {
    args.get_one::<String>(name)
        .map(String::as_str)
        .ok_or_else(|| anyhow!("Missing argument: {}", name))
}

fn provider_arg(args: &ArgMatches) -> Result<ProviderId> {
    Ok(required(args, "provider")?.parse()?)
}

async fn generate(args: &ArgMatches) -> Result<()> {
    let config = Config::load()?;
    let prompt = args
        .get_many::<String>("prompt")
        .unwrap_or_default()
        .map(String::as_str)
        .collect::<Vec<_>>()
        .join(" ");

    let provider_id = args
        .get_one::<String>("provider")
        .map(String::as_str)
        .unwrap_or_else(|| config.provider())
        .to_string();
    let known = provider_id.parse::<ProviderId>().ok();
    let api_key = args
        .get_one::<String>("api-key")
        .cloned()
        .or_else(|| known.and_then(|id| config.api_key(id)).map(str::to_string))
        .unwrap_or_default();
    let model = args
        .get_one::<String>("model")
        .cloned()
        .or_else(|| known.and_then(|id| config.model(id)).map(str::to_string))
        .unwrap_or_default();

    let store = Arc::new(StateStore::open(Config::get_state_path()?)?);
    let orchestrator = Orchestrator::new(
        store,
        Arc::new(ReqwestHttpClient::new()),
        Arc::new(ConsoleNotifier),
        config.generation.clone(),
    );

    info!("Processing prompt: {:?}", prompt);
    let ack = orchestrator.handle(GenerationCommand::StartBackgroundGeneration(GenerationRequest {
        provider_id,
        api_key,
        model,
        user_prompt: prompt,
        system_prompt: config.system_prompt().to_string(),
    }));
    if !ack.success {
        return Err(anyhow!(ack.message.unwrap_or_else(|| "Generation was not started".to_string())));
    }
    eprintln!("⏳ {}", ack.message.as_deref().unwrap_or("Generation started"));

    let state = tokio::select! {
        state = orchestrator.wait_for_completion() => state,
        _ = tokio::signal::ctrl_c() => {
            orchestrator.handle(GenerationCommand::CancelGeneration);
            orchestrator.store().state()
        }
    };

    match (state.generated_json, state.generation_error) {
        (Some(json), _) => {
            println!("{}", json);
            Ok(())
        }
        (None, Some(error)) => Err(anyhow!(error)),
        (None, None) => Err(anyhow!("Generation ended without a result")),
    }
}

fn status() -> Result<()> {
    let path = Config::get_state_path()?;
    if !path.exists() {
        println!("No generation yet");
        return Ok(());
    }
    let doc = StateStore::read_snapshot(&path)?;
    print_state(&doc.generation);
    if !doc.current_prompt.is_empty() {
        println!("Prompt: {}", doc.current_prompt);
    }
    if let Some(json) = &doc.generation.generated_json {
        println!("{}", json);
    }
    Ok(())
}

fn print_state(state: &GenerationState) {
    let badge = Badge::from_state(state).map(|b| b.text()).unwrap_or(" ");
    match state.phase() {
        Phase::Idle => println!("[{}] Idle", badge),
        Phase::Running => println!(
            "[{}] Running: {}",
            badge,
            state.generation_status.as_deref().unwrap_or("Generating...")
        ),
        Phase::Succeeded => println!("[{}] Complete", badge),
        Phase::Failed => println!(
            "[{}] Failed: {}",
            badge,
            state.generation_error.as_deref().unwrap_or("Unknown error")
        ),
    }
}

/// Polls the state file, printing each change, until the generation ends.
async fn watch() -> Result<()> {
    let path = Config::get_state_path()?;
    let mut last: Option<GenerationState> = None;
    loop {
        let state = read_state(&path)?;
        if last.as_ref() != Some(&state) {
            print_state(&state);
        }
        if !state.generation_in_progress {
            return Ok(());
        }
        last = Some(state);
        tokio::time::sleep(WATCH_POLL_INTERVAL).await;
    }
}

fn read_state(path: &Path) -> Result<GenerationState> {
    if path.exists() {
        Ok(StateStore::read_snapshot(path)?.generation)
    } else {
        Ok(GenerationState::default())
    }
}

fn history(args: &ArgMatches) -> Result<()> {
    let path = Config::get_state_path()?;
    match args.subcommand() {
        Some(("list", _)) => {
            let history = read_history(&path)?;
            if history.is_empty() {
                println!("No history yet");
            }
            for entry in history.list() {
                println!("{}  {}  {:<10}  {}", entry.id, entry.timestamp, entry.provider, entry.prompt);
            }
        }
        Some(("show", args)) => {
            let id = *args.get_one::<i64>("id").ok_or_else(|| anyhow!("Missing argument: id"))?;
            let history = read_history(&path)?;
            let entry = history.get(id).ok_or_else(|| anyhow!("No history entry with id {}", id))?;
            println!("{}", entry.json);
        }
        Some(("remove", args)) => {
            let id = *args.get_one::<i64>("id").ok_or_else(|| anyhow!("Missing argument: id"))?;
            let store = StateStore::open(&path)?;
            if store.remove_history(id) {
                println!("✅ Removed history entry {}", id);
            } else {
                return Err(anyhow!("No history entry with id {}", id));
            }
        }
        _ => unreachable!("clap requires a history subcommand"),
    }
    Ok(())
}

fn read_history(path: &Path) -> Result<flowgen::history::History> {
    if path.exists() {
        Ok(StateStore::read_snapshot(path)?.generation_history)
    } else {
        Ok(Default::default())
    }
}

async fn probe(args: &ArgMatches) -> Result<()> {
    let config = Config::load()?;
    let api_key = args
        .get_one::<String>("api-key")
        .map(String::as_str)
        .or_else(|| config.api_key(ProviderId::Claude))
        .ok_or_else(|| anyhow!("No Claude API key. Use --api-key or 'flowgen set-key claude <key>'"))?
        .to_string();

    let store = StateStore::open(Config::get_state_path()?)?;
    let outcome = probe_claude_auth(&ReqwestHttpClient::new(), &store, &api_key).await?;
    println!("✅ {}", outcome.message);
    for model in outcome.models {
        println!("  {}", model);
    }
    Ok(())
}
