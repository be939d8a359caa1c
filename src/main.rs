use clap::Parser;
use dynamic_consumers::config::Config;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse();

    let log_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(log_filter)
        .init();

    if let Err(e) = dynamic_consumers::run(config).await {
        tracing::error!(error = %e, "Consumer manager exited with an error");
        return Err(e);
    }
    Ok(())
}
