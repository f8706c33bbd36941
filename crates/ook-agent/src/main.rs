//! # ook-agent
//!
//! Launched by the editor as an NDJSON stdio agent; relays every frame to the
//! ook bridge running in the sandbox VM.

use anyhow::{Context, Result};
use clap::Parser;
use ook_agent::{run_passthrough, RelayEnd, Remote};
use ook_telemetry::{init_telemetry, LogFormat, LogTarget, TelemetryConfig};
use tracing::{info, Level};

/// Stdio passthrough to the ook bridge.
#[derive(Parser, Debug)]
#[command(name = "ook-agent", about = "Relay NDJSON stdio to the ook bridge")]
struct Cli {
    /// Bridge host (default: lima-<hostname>-sandbox).
    #[arg(long, env = "OOK_REMOTE_HOST")]
    host: Option<String>,

    /// Bridge port.
    #[arg(long, env = "OOK_REMOTE_PORT")]
    port: Option<String>,

    /// Log level for ook crates. Logs go to stderr.
    #[arg(long, env = "OOK_LOG_LEVEL", default_value = "info")]
    log_level: Level,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // stdout carries protocol frames
    let _telemetry = init_telemetry(TelemetryConfig {
        log_level: Level::WARN,
        module_levels: vec![("ook".into(), cli.log_level)],
        format: LogFormat::Json,
        target: LogTarget::Stderr,
    });

    let hostname = hostname::get().ok().and_then(|h| h.into_string().ok());
    let remote = Remote::resolve(cli.host, cli.port.as_deref(), hostname);
    let url = remote.url();

    let end = run_passthrough(tokio::io::stdin(), tokio::io::stdout(), &url)
        .await
        .with_context(|| format!("ook bridge relay failed ({url})"))?;

    match end {
        RelayEnd::ServerClosed(Some((code, reason))) => {
            info!(code, reason = %reason, "ook agent shutting down");
        }
        _ => info!(end = ?end, "ook agent shutting down"),
    }
    Ok(())
}
