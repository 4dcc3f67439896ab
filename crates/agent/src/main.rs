use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use firewall_agent::forwarder::{AgentConfig, Forwarder, tail_into};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = AgentConfig::from_env();
    tracing::info!(
        endpoint = %config.endpoint,
        files = config.files.len(),
        batch_size = config.batch_size,
        "log forwarder starting"
    );

    let (sender, receiver) = mpsc::unbounded_channel();
    for path in &config.files {
        tokio::spawn(tail_into(path.clone(), sender.clone()));
    }
    drop(sender);

    Forwarder::new(config).run(receiver).await;
}
