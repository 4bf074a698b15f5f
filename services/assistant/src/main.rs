//! Main Entrypoint for the Voice Assistant Host
//!
//! This binary is responsible for:
//! 1. Loading configuration from the environment.
//! 2. Initializing logging.
//! 3. Wiring the default audio devices into a voice session.
//! 4. Starting the conversation and hanging up on Ctrl+C.

mod audio;
mod config;

use anyhow::Context;
use audio::CpalAudio;
use config::Config;
use std::sync::Arc;
use tracing::info;
use voice_realtime::{
    session::{CallbackSet, SessionConfig, VoiceSession},
    signaling::{SignalingClient, SignalingConfig},
};

/// Listens for the `Ctrl+C` signal to hang up gracefully.
async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install Ctrl+C handler");
    info!("Received shutdown signal. Hanging up...");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env().context("Failed to load configuration")?;

    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .init();
    info!("Configuration loaded. Preparing voice session...");

    let signaling = SignalingClient::new(SignalingConfig {
        broker_url: config.broker_url.clone(),
        endpoint_prefix: config.endpoint_prefix.clone(),
        secondary_agent_id: config.secondary_agent_id.clone(),
    })
    .context("Failed to build signaling client")?;

    let session = VoiceSession::new(
        SessionConfig {
            agent: config.agent,
            user_name: config.user_name.clone(),
            first_message: config.first_message.clone(),
            language: config.language.clone(),
        },
        signaling,
        Arc::new(CpalAudio::new()),
    );

    // Signalled on the disconnect edge so the binary exits when the server
    // hangs up or the connection dies, not only on Ctrl+C.
    let ended = Arc::new(tokio::sync::Notify::new());
    session.set_callbacks(CallbackSet {
        on_connection_change: Box::new({
            let ended = ended.clone();
            move |connected| {
                if connected {
                    println!("[connected -- start talking]");
                } else {
                    println!("[disconnected]");
                    ended.notify_one();
                }
            }
        }),
        on_transcript: Box::new(|text, _| println!("you: {}", text)),
        on_agent_response: Box::new(|text| println!("agent: {}", text)),
        on_error: Box::new(|message| eprintln!("error: {}", message)),
    });

    session.start_conversation().await?;
    info!("Session active. Press Ctrl+C to hang up.");

    tokio::select! {
        _ = shutdown_signal() => session.stop_conversation(),
        _ = ended.notified() => info!("Session ended."),
    }
    Ok(())
}
