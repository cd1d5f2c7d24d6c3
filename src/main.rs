use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use base64::{engine::general_purpose::STANDARD, Engine};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};

use live_call::audio::CpalBackend;
use live_call::call::{CallConfig, CallSession};
use live_call::genai::{self, AspectRatio, Conversation, VideoRequest};
use live_call::settings::{self, AppSettings};
use live_call::streaming::{get_api_key, GeminiLiveTransport};
use live_call::{init_logging, CallSnapshot, CallStatus};

/// Live Call - talk to a Gemini model in real time
#[derive(Parser, Debug)]
#[command(name = "live-call")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Settings file (defaults to the user config directory)
    #[arg(short = 'c', long = "config", value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start a voice call on the default microphone and speakers
    Call,

    /// Chat with the model. Without a prompt, reads one message per line
    /// until end of input
    Chat {
        prompt: Option<String>,

        /// Use the deep thinking model
        #[arg(long)]
        deep: bool,
    },

    /// Animate an image into a short video
    Video {
        image: PathBuf,

        #[arg(short, long, default_value = "")]
        prompt: String,

        /// 9:16 instead of 16:9
        #[arg(long)]
        portrait: bool,
    },

    /// Print the effective settings
    Settings {
        /// Also write them back, creating the file if missing
        #[arg(long)]
        save: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present (for development convenience)
    // Silently ignore if not found - production uses system env vars
    let _ = dotenvy::dotenv();

    init_logging();

    // Crypto provider for the WebSocket TLS connection
    let _ = rustls::crypto::ring::default_provider().install_default();

    let cli = Cli::parse();
    let settings = match &cli.config {
        Some(path) => settings::load_settings_from(path),
        None => settings::load_settings(),
    };

    match cli.command {
        Commands::Call => run_call(&settings).await,
        Commands::Chat { prompt, deep } => run_chat(settings, prompt, deep).await,
        Commands::Video {
            image,
            prompt,
            portrait,
        } => run_video(&settings, &image, prompt, portrait).await,
        Commands::Settings { save } => {
            println!("{}", serde_json::to_string_pretty(&settings)?);
            if save {
                match &cli.config {
                    Some(path) => settings::save_settings_to(path, &settings),
                    None => settings::save_settings(&settings),
                }
                .map_err(|e| anyhow!(e))?;
            }
            Ok(())
        }
    }
}

fn require_api_key() -> anyhow::Result<String> {
    get_api_key().ok_or_else(|| anyhow!("{}", genai::GenAiError::MissingApiKey))
}

async fn run_call(settings: &AppSettings) -> anyhow::Result<()> {
    // A missing key fails the call through the transport like any open error
    let api_key = get_api_key().unwrap_or_default();

    let session = CallSession::new(
        Arc::new(CpalBackend::default()),
        Arc::new(GeminiLiveTransport::new()),
        CallConfig::from_settings(settings, api_key),
    );
    let mut updates = session.subscribe();

    println!("Connecting...");
    if let Err(e) = session.start().await {
        session.stop().await;
        bail!("Call failed: {}", e);
    }
    println!("Connected. Type 'm' + Enter to toggle mute, 'q' + Enter to hang up.");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut meter = tokio::time::interval(Duration::from_secs(1));

    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => match line.trim() {
                    "m" => {
                        session.set_muted(!session.is_muted());
                        println!("{}", if session.is_muted() { "Muted" } else { "Unmuted" });
                    }
                    "q" => break,
                    "" => {}
                    other => println!("Unknown command: {}", other),
                },
                Ok(None) => break,
                Err(e) => {
                    log::warn!("Failed to read stdin: {}", e);
                    break;
                }
            },
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = updates.borrow_and_update().clone();
                if matches!(snapshot.status, CallStatus::Ended | CallStatus::Failed { .. }) {
                    break;
                }
            }
            _ = meter.tick() => print_meter(&session.snapshot()),
        }
    }

    println!("Hanging up...");
    session.stop().await;

    if let Some(error) = session.error() {
        bail!("Call failed: {}", error);
    }
    println!("Call ended.");
    Ok(())
}

fn print_meter(snapshot: &CallSnapshot) {
    let bars = (snapshot.volume_level.clamp(0.0, 100.0) / 5.0) as usize;
    println!(
        "[{:<20}] {}sent={} played={}",
        "#".repeat(bars),
        if snapshot.muted { "(muted) " } else { "" },
        snapshot.chunks_sent,
        snapshot.chunks_scheduled
    );
}

async fn run_chat(mut settings: AppSettings, prompt: Option<String>, deep: bool) -> anyhow::Result<()> {
    let api_key = require_api_key()?;
    settings.use_deep_thinking |= deep;
    let mut conversation = Conversation::new();

    if let Some(prompt) = prompt {
        let reply = conversation.send(&api_key, &prompt, &settings).await;
        if reply.is_error {
            bail!("{}", reply.text);
        }
        println!("{}", reply.text);
        return Ok(());
    }

    println!("Chatting with {}. End input (Ctrl-D) to quit.", genai::chat_model(&settings));
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let text = line.trim();
        if text.is_empty() {
            continue;
        }
        let reply = conversation.send(&api_key, text, &settings).await;
        println!("{}\n", reply.text);
    }
    Ok(())
}

async fn run_video(
    settings: &AppSettings,
    image: &Path,
    prompt: String,
    portrait: bool,
) -> anyhow::Result<()> {
    let api_key = require_api_key()?;

    let bytes = tokio::fs::read(image)
        .await
        .with_context(|| format!("Failed to read {:?}", image))?;

    let request = VideoRequest {
        prompt,
        mime_type: genai::sniff_image_mime(&bytes).to_string(),
        image_base64: STANDARD.encode(&bytes),
        aspect_ratio: if portrait {
            AspectRatio::Portrait
        } else {
            AspectRatio::Landscape
        },
    };

    println!("Generating video, this can take a few minutes...");
    let uri = genai::generate_video(&api_key, &request, settings).await?;
    println!("{}", uri);
    Ok(())
}
