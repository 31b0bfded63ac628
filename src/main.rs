use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use transcript_relay::config::Config;
use transcript_relay::stt::DeepgramService;
use transcript_relay::ws::run_server;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    log::info!("transcript-relay {}", transcript_relay::version_string());

    let config = load_config()?;
    config.validate()?;

    let service = DeepgramService::from_config(&config.recognizer)?;
    run_server(&config, Arc::new(service)).await?;
    Ok(())
}

/// Load config from `RELAY_CONFIG` or the default location, then apply
/// environment overrides.
fn load_config() -> Result<Config> {
    let config = match std::env::var_os("RELAY_CONFIG") {
        // An explicit path must exist
        Some(path) => {
            let path = PathBuf::from(path);
            Config::load(&path)
                .with_context(|| format!("Failed to load config from {}", path.display()))?
        }
        None => match Config::default_path() {
            Some(path) => Config::load_or_default(&path)?,
            None => Config::default(),
        },
    };

    Ok(config.with_env_overrides())
}
