use tokio::io::BufReader;
use tracing_subscriber::{fmt, EnvFilter};

use parley_bridge::run;
use parley_core::{Dispatcher, RelayConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // .env is optional
    let _ = dotenvy::dotenv();

    // Logs go to stderr; stdout carries the reply lines
    fmt()
        .compact()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = RelayConfig::load();
    tracing::info!(
        gateway_mode = config.use_gateway_mode,
        model = %config.direct.model,
        "Starting parley bridge"
    );
    let dispatcher = Dispatcher::builder(config).build()?;

    let answered = run(
        &dispatcher,
        BufReader::new(tokio::io::stdin()),
        tokio::io::stdout(),
    )
    .await?;
    tracing::info!(answered, "Bridge finished");
    Ok(())
}
