mod app;
mod config;
mod models;
mod providers;
mod services;

use anyhow::Result;
use tracing_subscriber::EnvFilter;

use app::{App, AppState};
use config::AppConfig;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let config = AppConfig::from_env()?;
    let state = AppState::open(&config)?;
    App::new(state).run().await
}
