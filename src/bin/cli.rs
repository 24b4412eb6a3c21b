//! CLI binary for buddy.

use anyhow::Context;
use buddy::audio::{CpalListener, CpalPlayback};
use buddy::llm::OpenAiChatClient;
use buddy::llm::api::build_http_client;
use buddy::tts::OpenAiTextToSpeech;
use buddy::{
    ConversationRunner, ConversationService, MemoryService, ReplyGenerator, RuntimeEvent,
    SpeechConfig,
};
use clap::{Parser, Subcommand};
use std::io::{BufRead, Read};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

/// Buddy: talk to an English conversation partner.
#[derive(Parser)]
#[command(name = "buddy", version, about)]
struct Cli {
    /// Path to TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Also write debug logs to a daily rotating file in this directory.
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Dotenv file loaded before configuration. Pass an empty value to skip.
    /// Variables already set in the environment win.
    #[arg(long, default_value = ".env")]
    env_file: String,

    /// Subcommand to run.
    #[command(subcommand)]
    command: Option<Command>,
}

/// Available commands.
#[derive(Subcommand)]
enum Command {
    /// Start a voice conversation.
    Chat,

    /// Send one text prompt to the chat model and print the reply.
    Ask {
        /// User prompt. Read from stdin when omitted.
        prompt: Option<String>,

        /// System prompt override for this request.
        #[arg(long)]
        system: Option<String>,
    },

    /// List available audio devices.
    Devices,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let env_loaded = load_env_file(Path::new(&cli.env_file))?;
    let _log_guard = init_tracing(cli.log_dir.as_deref())?;
    if let Some(path) = env_loaded {
        info!("loaded environment from {}", path.display());
    }

    match cli.command.unwrap_or(Command::Chat) {
        Command::Chat => run_chat(load_config(cli.config.as_deref())?).await,
        Command::Ask { prompt, system } => {
            let mut config = load_config(cli.config.as_deref())?;
            if system.is_some() {
                config.llm.system_prompt = system;
            }
            run_ask(config, prompt).await
        }
        Command::Devices => list_devices(),
    }
}

/// Load `path` into the process environment without overriding variables
/// that are already set. A missing file is not an error.
fn load_env_file(path: &Path) -> anyhow::Result<Option<PathBuf>> {
    if path.as_os_str().is_empty() {
        return Ok(None);
    }
    match dotenvy::from_path(path) {
        Ok(()) => Ok(Some(path.to_path_buf())),
        Err(e) if e.not_found() => Ok(None),
        Err(e) => Err(e).with_context(|| format!("failed to load {}", path.display())),
    }
}

/// Stderr logging filtered by `RUST_LOG`, plus an optional debug log file.
fn init_tracing(log_dir: Option<&Path>) -> anyhow::Result<Option<WorkerGuard>> {
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("buddy=info")),
        );

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let appender = tracing_appender::rolling::daily(dir, "buddy.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer)
                .with_filter(EnvFilter::new("buddy=debug"));
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(file_layer)
        .init();
    Ok(guard)
}

/// Explicit path, else the default path if present, else built-in defaults.
/// `OPENAI_*` and `BUDDY_STT_*` environment variables override the file.
fn load_config(path: Option<&Path>) -> anyhow::Result<SpeechConfig> {
    let mut config = match path {
        Some(path) => SpeechConfig::from_file(path)?,
        None => {
            let default_path = SpeechConfig::default_config_path();
            if default_path.exists() {
                info!("loading config from {}", default_path.display());
                SpeechConfig::from_file(&default_path)?
            } else {
                SpeechConfig::default()
            }
        }
    };
    config.apply_env_overrides()?;
    config.validate()?;
    if config.llm.api_key.is_empty() {
        warn!("no API key configured; set OPENAI_API_KEY or llm.api_key");
    }
    Ok(config)
}

async fn run_chat(config: SpeechConfig) -> anyhow::Result<()> {
    println!("Buddy v{}", env!("CARGO_PKG_VERSION"));

    let http = build_http_client(&config.llm)?;
    let memory = Arc::new(Mutex::new(MemoryService::from_config(&config.memory)));
    let chat = OpenAiChatClient::with_client(http.clone(), &config.llm);
    let reply = ConversationService::new(chat, memory, &config.llm);
    let stt = buddy::stt::from_config(http.clone(), &config.stt, &config.llm)?;
    let tts = OpenAiTextToSpeech::with_client(http, &config.tts, &config.llm);
    let listener = CpalListener::new(&config.audio, &config.vad);
    let sink = CpalPlayback::new(&config.audio);

    let wake_display = config
        .conversation
        .wake_phrases
        .first()
        .cloned()
        .unwrap_or_default();

    let (events_tx, events_rx) = broadcast::channel(64);
    let runner = ConversationRunner::new(
        config,
        Arc::new(listener),
        stt,
        Arc::new(reply),
        Arc::new(tts),
        Arc::new(sink),
    )
    .with_runtime_events(events_tx);

    let cancel = runner.cancel_token();
    let printer = tokio::spawn(print_events(events_rx, cancel.clone()));

    // Handle Ctrl+C
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("received Ctrl+C, shutting down...");
            cancel.cancel();
        }
    });

    println!("\nSay \"{wake_display}\" to start talking. Press Ctrl+C to quit.\n");
    let result = runner.run().await;
    report_printer_exit(printer.await);
    result?;
    Ok(())
}

/// Log a panicked or aborted event printer. Returns `true` on a clean exit.
fn report_printer_exit(joined: Result<(), tokio::task::JoinError>) -> bool {
    match joined {
        Ok(()) => true,
        Err(e) => {
            warn!("event printer task failed: {e}");
            false
        }
    }
}

/// Text-only round trip through the same reply generator the voice loop uses.
async fn run_ask(config: SpeechConfig, prompt: Option<String>) -> anyhow::Result<()> {
    let prompt = match prompt {
        Some(prompt) => prompt,
        None => read_prompt()?,
    };
    let prompt = prompt.trim();
    anyhow::ensure!(!prompt.is_empty(), "no prompt given");

    let chat = OpenAiChatClient::new(&config.llm)?;
    let memory = Arc::new(Mutex::new(MemoryService::from_config(&config.memory)));
    let service = ConversationService::new(chat, memory, &config.llm);
    let reply = service.prepare_reply(prompt, None).await?;
    service.commit_assistant_reply(&reply);
    println!("{reply}");
    Ok(())
}

/// Whole of stdin, or one interactive line when stdin is empty.
fn read_prompt() -> anyhow::Result<String> {
    let mut input = String::new();
    std::io::stdin().read_to_string(&mut input)?;
    if input.trim().is_empty() {
        eprint!("> ");
        std::io::stdin().lock().read_line(&mut input)?;
    }
    Ok(input)
}

async fn print_events(
    mut rx: broadcast::Receiver<RuntimeEvent>,
    cancel: tokio_util::sync::CancellationToken,
) {
    loop {
        let event = tokio::select! {
            () = cancel.cancelled() => break,
            event = rx.recv() => event,
        };
        match event {
            Ok(RuntimeEvent::UserTranscript { text }) => println!("You: {text}"),
            Ok(RuntimeEvent::AssistantReply { text, .. }) => println!("Buddy: {text}"),
            Ok(RuntimeEvent::Awake) => println!("[listening]"),
            Ok(RuntimeEvent::Asleep) => println!("[sleeping]"),
            Ok(RuntimeEvent::CalibrationStarted) => println!("[calibrating, please stay quiet]"),
            Ok(RuntimeEvent::CalibrationFailed { message }) => {
                eprintln!("calibration failed: {message}");
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(n)) => warn!("event printer lagged by {n}"),
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn list_devices() -> anyhow::Result<()> {
    println!("Input devices:");
    for name in CpalListener::list_input_devices()? {
        println!("  {name}");
    }

    println!("\nOutput devices:");
    for name in CpalPlayback::list_output_devices()? {
        println!("  {name}");
    }

    Ok(())
}
