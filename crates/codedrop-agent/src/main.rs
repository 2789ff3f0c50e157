// Browser agent entry point.
//
// Startup sequence:
// 1. Load config, initialize tracing (stderr)
// 2. Open the settings store and watch it for edits
// 3. Attach to Chrome over its DevTools endpoint
// 4. Create channels and spawn client, dispatcher and orchestrator
// 5. Run until Ctrl+C

mod host;
mod page;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chromiumoxide::Browser;
use codedrop_core::client::ReconnectingClient;
use codedrop_core::config::{self, SettingsStore};
use codedrop_core::dispatch::{self, ProfileRegistry};
use codedrop_core::orchestrator::TabOrchestrator;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tracing::{error, info};

use crate::host::CdpHost;

/// How often the settings file is re-read for outside edits.
const SETTINGS_POLL: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 1. Config and tracing
    let config = config::load_config().context("failed to load configuration")?;
    init_tracing(&config.logging.filter)?;
    info!("Agent starting up");

    // 2. Settings store
    let settings_path = config
        .settings_path()
        .context("failed to locate settings file")?;
    let store = Arc::new(SettingsStore::open(&settings_path).context("failed to open settings")?);
    info!(
        "Settings at {}, relay {}",
        store.path().display(),
        store.ws_url()
    );
    let watcher = Arc::clone(&store).watch_file(SETTINGS_POLL);

    // 3. Browser
    let (browser, mut handler) = Browser::connect(config.browser.debug_url.as_str())
        .await
        .with_context(|| format!("failed to connect to browser at {}", config.browser.debug_url))?;
    let handler_task = tokio::spawn(async move {
        while let Some(event) = handler.next().await {
            if event.is_err() {
                break;
            }
        }
    });
    info!("Attached to browser at {}", config.browser.debug_url);

    let registry = Arc::new(ProfileRegistry::builtin());
    let host = Arc::new(CdpHost::new(browser, Arc::clone(&registry)));

    // 4. Channels and tasks
    let (jobs_tx, jobs_rx) = mpsc::channel(64);
    let (tasks_tx, tasks_rx) = mpsc::channel(64);

    let (client, _client_handle) = ReconnectingClient::init(&store, jobs_tx);
    let client_task = tokio::spawn(async move {
        if let Err(e) = client.run().await {
            error!("Relay client error: {e}");
        }
    });

    let dispatcher_task = tokio::spawn(async move {
        if let Err(e) = dispatch::run_dispatcher(registry, jobs_rx, tasks_tx).await {
            error!("Dispatcher error: {e}");
        }
    });

    let orchestrator_task = tokio::spawn(async move {
        if let Err(e) = TabOrchestrator::new(host, tasks_rx).run().await {
            error!("Orchestrator error: {e}");
        }
    });

    // 5. Wait for shutdown
    info!("Agent ready");
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl+C")?;
    info!("Shutdown requested");

    client_task.abort();
    dispatcher_task.abort();
    orchestrator_task.abort();
    watcher.abort();
    handler_task.abort();

    info!("Agent shut down cleanly");
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
        .with_thread_ids(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("failed to set tracing subscriber")?;

    Ok(())
}
