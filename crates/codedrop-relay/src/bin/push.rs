// Push one job to the relay: read source code from a file or stdin and send
// it as a job frame for the given problem URL.

use std::io::Read;
use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::Parser;
use codedrop_core::config::DEFAULT_WS_URL;
use codedrop_core::protocol::JobFrame;
use futures_util::SinkExt;
use tokio_tungstenite::tungstenite::Message;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "codedrop-push")]
#[command(about = "Send source code to every browser connected to the relay", version)]
struct Cli {
    /// Problem page URL on the judge
    #[arg(long, short = 'u')]
    url: String,

    /// Source file to submit (default: read stdin)
    #[arg(long, short = 'f')]
    file: Option<PathBuf>,

    /// Relay address
    #[arg(long, short = 'r', default_value = DEFAULT_WS_URL)]
    relay: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let code = read_code(cli.file.as_ref())?;
    if code.is_empty() {
        bail!("no source code to send");
    }

    let frame = serde_json::to_string(&JobFrame {
        url: cli.url.clone(),
        code,
    })?;

    let (mut ws, _) = tokio_tungstenite::connect_async(cli.relay.as_str())
        .await
        .with_context(|| format!("failed to connect to relay at {}", cli.relay))?;
    ws.send(Message::Text(frame.into()))
        .await
        .context("failed to send job")?;
    ws.close(None).await.context("failed to close connection")?;

    info!("Sent {} to {}", cli.url, cli.relay);
    Ok(())
}

fn read_code(file: Option<&PathBuf>) -> anyhow::Result<String> {
    match file {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display())),
        None => {
            let mut code = String::new();
            std::io::stdin()
                .read_to_string(&mut code)
                .context("failed to read stdin")?;
            Ok(code)
        }
    }
}
