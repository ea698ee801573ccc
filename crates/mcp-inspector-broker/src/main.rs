use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use mcp_inspector_broker::config;
use mcp_inspector_broker::{BrokerOptions, BrokerServer};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let options = BrokerOptions::from_env();
    let server = BrokerServer::new(options);
    server.start().await?;
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    match std::env::var(config::LOG_FILE_ENV).ok().filter(|p| !p.is_empty()) {
        Some(path) => match std::fs::OpenOptions::new().create(true).append(true).open(&path) {
            Ok(file) => {
                builder.with_writer(Arc::new(file)).with_ansi(false).init();
            }
            Err(err) => {
                builder.init();
                tracing::warn!("failed to open log file {path}: {err}; logging to stdout");
            }
        },
        None => builder.init(),
    }
}
