mod commands;
mod config;

use clap::Parser;
use tracing::debug;
use tracing_subscriber::EnvFilter;

use config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr; stdout carries the JSON result
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = Config::parse();
    debug!("Remote store: {}", config.remote_url);
    debug!("Buffer dir: {}", config.effective_buffer_dir().display());

    let output = commands::run(&config).await?;
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
