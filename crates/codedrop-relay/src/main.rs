// Relay entry point.
//
// Startup sequence:
// 1. Initialize tracing (stderr)
// 2. Load config
// 3. Bind the listener
// 4. Serve until Ctrl+C

use codedrop_core::config;
use codedrop_core::relay::{self, RelayHub};

use anyhow::Context;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = config::load_config().context("failed to load configuration")?;
    init_tracing(&config.logging.filter)?;
    info!("Relay starting up");

    let addr = config.relay_addr().context("invalid relay address")?;
    let listener = relay::bind(addr)
        .await
        .with_context(|| format!("failed to bind relay on {addr}"))?;

    let hub = RelayHub::new();
    let server = tokio::spawn(relay::run(listener, hub.clone()));
    info!("Relay ready on ws://{addr}");

    tokio::select! {
        result = server => {
            if let Err(e) = result {
                error!("Relay server task failed: {e}");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown requested ({} clients connected)", hub.client_count());
        }
    }

    info!("Relay shut down cleanly");
    Ok(())
}

/// Log to stderr. `RUST_LOG` overrides the configured filter.
fn init_tracing(default_filter: &str) -> anyhow::Result<()> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_line_number(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("failed to set tracing subscriber")?;

    Ok(())
}
