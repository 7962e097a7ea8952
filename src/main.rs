use framed_reactor::config::Config;
use framed_reactor::runtime;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        listen = %config.listen,
        backend = ?config.backend,
        handler = ?config.handler,
        max_message_size = config.max_message_size,
        max_connections = config.max_connections,
        "Starting framed-reactor server"
    );

    runtime::run(config)?;
    Ok(())
}
