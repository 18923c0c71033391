//! liverelay - realtime bidirectional media relay
//!
//! Captures live microphone audio (and optionally camera or screen
//! frames), streams it to the Gemini Live API over a persistent
//! bidirectional session, and plays back synthesized audio responses.
//! An HTTP control surface starts, pauses, resumes and terminates the
//! session.

#![forbid(unsafe_code)]

/// PulseAudio microphone and speaker devices
mod audio;
/// Camera frame source (enabled with the "camera" feature)
mod camera;
/// Shared payload and mode types
mod events;
/// Gemini Live API session over WebSocket
mod gemini;
/// Device trait seams
mod media;
/// Pipeline task loops
mod pipeline;
/// Bounded async FIFO
mod queue;
/// Remote session boundary
mod remote;
/// Screen frame source (enabled with the "capture" feature)
mod screen;
/// HTTP control surface
mod server;
/// Session controller actor
mod session;

use anyhow::Context;
use clap::Parser;
use events::VideoMode;
use gemini::{GeminiConfig, GeminiConnector};
use media::SystemDevices;
use session::SessionController;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "liverelay", about = "Realtime bidirectional media relay")]
struct Args {
    /// Video mode for new sessions
    #[arg(long, value_enum, default_value_t = VideoMode::None)]
    mode: VideoMode,

    /// Address of the HTTP control surface
    #[arg(long, default_value = "127.0.0.1:5000")]
    bind: SocketAddr,

    /// Live API model
    #[arg(long, default_value = gemini::DEFAULT_MODEL)]
    model: String,

    /// System instruction for the assistant
    #[arg(long)]
    system_instruction: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    info!("starting liverelay (video mode: {})", args.mode);

    // Single credential, read once at process start.
    let api_key =
        std::env::var("GEMINI_API_KEY").context("GEMINI_API_KEY must be set")?;

    let mut config = GeminiConfig::from_api_key(&api_key).with_model(&args.model);
    if let Some(instruction) = &args.system_instruction {
        config = config.with_system_instruction(instruction);
    }

    let connector = Arc::new(GeminiConnector::new(config));
    let devices = Arc::new(SystemDevices::new("liverelay"));
    let (controller, handle) = SessionController::new(connector, devices, args.mode);
    tokio::spawn(controller.run());

    let listener = tokio::net::TcpListener::bind(args.bind)
        .await
        .with_context(|| format!("failed to bind {}", args.bind))?;
    info!("control surface listening on {}", args.bind);
    axum::serve(listener, server::router(handle)).await?;

    Ok(())
}
