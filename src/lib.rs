pub mod cli;
pub mod collector;
pub mod config;
pub mod crawler;
pub mod discovery;
pub mod error;
pub mod fingerprint;
pub mod normalize;
pub mod template;
pub mod topology;
pub mod transport;

use anyhow::Result;

pub fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
        )
        .with_target(false)
        .with_thread_ids(true)
        .init();
}

pub async fn run() -> Result<()> {
    init_logging();
    cli::run().await
}
