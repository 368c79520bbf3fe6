//! CLI binary for selkie.

use clap::{Parser, Subcommand};
use selkie::audio::capture::CpalCapture;
use selkie::audio::playback::CpalPlayback;
use selkie::tools::{ToolHandler, ToolInvocation, research_topic_declaration};
use selkie::{SessionConfig, SessionEvent, SessionOptions, VoiceSession};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Selkie: real-time duplex voice session engine.
#[derive(Parser)]
#[command(name = "selkie", version, about)]
struct Cli {
    /// Path to TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Subcommand to run.
    #[command(subcommand)]
    command: Option<Command>,
}

/// Available commands.
#[derive(Subcommand)]
enum Command {
    /// Start a live voice session against the configured link.
    Run {
        /// Override the link URL from the config file.
        #[arg(long)]
        url: Option<String>,
    },

    /// List available audio devices.
    Devices,
}

/// Stand-in handler that logs research triggers to stdout.
struct PrintHandler;

#[async_trait::async_trait]
impl ToolHandler for PrintHandler {
    async fn handle(&self, invocation: &ToolInvocation) -> anyhow::Result<String> {
        let topic = invocation.args["topic"].as_str().unwrap_or("<unknown>");
        println!("research requested: {topic}");
        Ok(format!("Research for '{topic}' has been triggered."))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing — override with RUST_LOG to see everything.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("selkie=info")),
        )
        .init();

    let cli = Cli::parse();

    let mut config = if let Some(ref path) = cli.config {
        SessionConfig::from_file(path)?
    } else {
        SessionConfig::default()
    };

    match cli.command.unwrap_or(Command::Run { url: None }) {
        Command::Run { url } => {
            if let Some(url) = url {
                config.link.url = url;
            }
            run_session(config).await
        }
        Command::Devices => list_devices(),
    }
}

async fn run_session(config: SessionConfig) -> anyhow::Result<()> {
    println!("Selkie v{}", env!("CARGO_PKG_VERSION"));

    let options = SessionOptions {
        system_instruction: "You are a sophisticated research concierge.".into(),
        tools: vec![research_topic_declaration()],
        handler: Arc::new(PrintHandler),
        competing_output: None,
    };

    let session = VoiceSession::start(config, options).await?;
    let mut events = session.subscribe();

    println!("\nReady! Speak into your microphone. Press Ctrl+C to stop.\n");

    let stop_session = tokio::signal::ctrl_c();
    tokio::pin!(stop_session);

    loop {
        tokio::select! {
            result = &mut stop_session => {
                if result.is_ok() {
                    info!("received Ctrl+C, shutting down...");
                }
                session.stop();
                session.ended().await;
                break;
            }
            event = events.recv() => {
                match event {
                    Ok(SessionEvent::State(state)) => println!("[{state:?}]"),
                    Ok(SessionEvent::Transcript(text)) => println!("  {text}"),
                    Ok(SessionEvent::ToolCall { name, .. }) => println!("  tool call: {name}"),
                    Ok(SessionEvent::Ended { error }) => {
                        if let Some(error) = error {
                            eprintln!("session ended: {error}");
                        }
                        break;
                    }
                    Ok(_) => {}
                    Err(_) => break,
                }
            }
        }
    }

    Ok(())
}

fn list_devices() -> anyhow::Result<()> {
    println!("Input devices:");
    for name in CpalCapture::list_input_devices()? {
        println!("  {name}");
    }
    println!("\nOutput devices:");
    for name in CpalPlayback::list_output_devices()? {
        println!("  {name}");
    }
    Ok(())
}
