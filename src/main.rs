mod bot;
mod config;
mod llm;
mod platform;
mod server;
#[cfg(test)]
mod testing;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::bot::Relay;
use crate::config::Config;
use crate::llm::GeminiClient;
use crate::platform::line::LineClient;
use crate::server::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env before the log filter is read
    let dotenv = dotenvy::dotenv();

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,linegem=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Ok(path) = dotenv {
        info!("Loaded environment from {}", path.display());
    }

    // Load configuration
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = Config::load(config_path.as_deref()).context("Failed to load configuration")?;

    info!("Configuration loaded successfully");
    info!("  Model: {}", config.gemini.model);
    info!("  Max concurrent events: {}", config.server.max_concurrent_events);

    // Clients are built once and shared by every request
    let generator = Arc::new(GeminiClient::new(config.gemini.clone()));
    let sender = Arc::new(LineClient::new(config.line.clone()));
    let relay = Relay::new(
        generator,
        sender,
        config.reply.clone(),
        config.server.max_concurrent_events,
    );

    let state = AppState::new(relay, &config.line.channel_secret);
    server::run(&config.server, state).await
}
