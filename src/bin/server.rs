//! Gateway server binary.
//!
//! Takes an optional config file path as its only argument; without one
//! it tries the default config location and falls back to built-in
//! defaults. All state is in memory, so a restart forgets every call.

use std::path::PathBuf;
use std::sync::Arc;

use siren::config::SirenConfig;
use siren::store::MemoryStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = load_config()?;
    tracing::info!(
        bind = %config.server.bind_addr,
        speech_configured = config.speech.is_configured(),
        recording = config.telephony.record_calls,
        "siren starting"
    );

    let store = Arc::new(MemoryStore::new());

    tokio::select! {
        result = siren::gateway::serve(Arc::new(config), store) => result?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received Ctrl+C, shutting down");
        }
    }
    Ok(())
}

fn load_config() -> anyhow::Result<SirenConfig> {
    let path = match std::env::args_os().nth(1) {
        Some(arg) => PathBuf::from(arg),
        None => {
            let default = SirenConfig::default_config_path();
            if !default.exists() {
                tracing::info!("no config file; using defaults");
                return Ok(SirenConfig::default());
            }
            default
        }
    };
    tracing::info!(path = %path.display(), "loading config");
    Ok(SirenConfig::from_file(&path)?)
}
