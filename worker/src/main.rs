use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use capstan_worker::ProcessManager;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // stdout carries the wire protocol; all diagnostics go to stderr, where
    // the front end bridges them into its own logs.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let manager = Arc::new(ProcessManager::new());
    capstan_worker::serve(manager).await
}
