//! chat-relay - streaming chat-completion relay
//!
//! Accepts OpenAI-style chat completion requests, forwards them to the
//! upstream provider with streaming forced on, and relays the reply as SSE.

use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use chat_relay::config::Config;
use chat_relay::proxy::run_server;

#[derive(Parser)]
#[command(name = "chat-relay")]
#[command(about = "Streaming chat-completion relay for OpenAI-compatible providers")]
#[command(version)]
struct Cli {
    /// Optional TOML configuration file. Without it, configuration is read
    /// from the environment (GROQ_API_KEY, PORT, ...).
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the listen port
    #[arg(short, long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // A missing .env is fine; real environment variables still apply
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "chat_relay=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let loaded = match &cli.config {
        Some(path) => {
            tracing::info!(config = %path.display(), "Loading configuration file");
            Config::from_file_with_env(path)
        }
        None => Config::from_env(),
    };

    let (mut config, key_sources) = match loaded {
        Ok(loaded) => loaded,
        Err(e) => {
            tracing::error!(error = %e, "Invalid configuration");
            return Err(e.into());
        }
    };

    for (key, source) in &key_sources {
        tracing::info!(key = %key, source = %source, "Resolved secret");
        if *source == chat_relay::config::KeySource::Default {
            tracing::warn!(key = %key, "Using built-in default key; set RELAY_API_KEY");
        }
    }

    if let Some(port) = cli.port {
        tracing::info!(port, "Override listen port");
        config.server.port = port;
    }

    run_server(config).await
}
