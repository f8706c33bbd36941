//! # ook-bridge
//!
//! Runs inside the sandbox VM: accepts one WebSocket peer at a time and
//! bridges it to a freshly spawned NDJSON stdio agent process.

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use ook_bridge::{BridgeConfig, BridgeServer, ProcessSpec, ResumePolicy, DEFAULT_PORT};
use ook_telemetry::{init_telemetry, LogFormat, TelemetryConfig};
use tracing::{info, Level};

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogFormatArg {
    Json,
    Pretty,
}

impl From<LogFormatArg> for LogFormat {
    fn from(arg: LogFormatArg) -> Self {
        match arg {
            LogFormatArg::Json => LogFormat::Json,
            LogFormatArg::Pretty => LogFormat::Pretty,
        }
    }
}

/// WebSocket to stdio bridge for a single agent process.
#[derive(Parser, Debug)]
#[command(name = "ook-bridge", about = "Bridge one WebSocket peer to an NDJSON stdio agent")]
struct Cli {
    /// Host to bind.
    #[arg(long, env = "OOK_HOST", default_value = "0.0.0.0")]
    host: String,

    /// Port to bind (0 for auto-assign).
    #[arg(long, env = "OOK_PORT", default_value_t = DEFAULT_PORT)]
    port: u16,

    #[arg(long, env = "OOK_LOG_LEVEL", default_value = "info")]
    log_level: Level,

    #[arg(long, value_enum, default_value = "json")]
    log_format: LogFormatArg,

    /// Parent environment variables passed to the agent (comma-separated).
    #[arg(long, env = "OOK_PASS_ENV", value_delimiter = ',', default_value = "ANTHROPIC_API_KEY")]
    pass_env: Vec<String>,

    /// Seconds between SIGTERM and SIGKILL when stopping the agent.
    #[arg(long, default_value_t = 5)]
    terminate_grace_secs: u64,

    /// Keep an authenticated agent alive across reconnects.
    #[arg(long)]
    resume_authenticated: bool,

    /// Agent command and arguments.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

impl Cli {
    /// The agent invocation: positional arguments, else `OOK_AGENT_COMMAND`
    /// plus whitespace-separated `OOK_AGENT_ARGS`.
    fn agent(&self) -> Result<ProcessSpec> {
        let (command, args) = match self.command.split_first() {
            Some((command, args)) => (command.clone(), args.to_vec()),
            None => {
                let command = std::env::var("OOK_AGENT_COMMAND")
                    .context("no agent command given (pass it after the flags or set OOK_AGENT_COMMAND)")?;
                let args = std::env::var("OOK_AGENT_ARGS")
                    .map(|raw| raw.split_whitespace().map(str::to_owned).collect())
                    .unwrap_or_default();
                (command, args)
            }
        };
        if command.trim().is_empty() {
            bail!("agent command is empty");
        }

        let mut spec = ProcessSpec::new(command, args);
        spec.env_allowlist = self
            .pass_env
            .iter()
            .map(|name| name.trim().to_owned())
            .filter(|name| !name.is_empty())
            .collect();
        spec.terminate_grace_ms = self.terminate_grace_secs.saturating_mul(1000);
        Ok(spec)
    }

    fn bridge_config(&self) -> Result<BridgeConfig> {
        let mut config = BridgeConfig::new(self.agent()?);
        config.host = self.host.clone();
        config.port = self.port;
        if self.resume_authenticated {
            config.resume_policy = ResumePolicy::ResumeAuthenticated;
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let telemetry = init_telemetry(TelemetryConfig {
        log_level: cli.log_level,
        format: cli.log_format.into(),
        ..Default::default()
    });

    let config = cli.bridge_config()?;
    let handle = BridgeServer::new(config, telemetry.telemetry().clone())
        .listen()
        .await
        .context("failed to start ook bridge")?;
    info!(port = handle.port(), "ook bridge ready");

    shutdown_signal().await;
    info!("shutdown signal received");

    handle.shutdown().await.context("shutdown did not complete cleanly")?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn positional_command_and_args() {
        let cli = Cli::parse_from(["ook-bridge", "--port", "9000", "claude-code-acp", "--stdio"]);
        let config = cli.bridge_config().unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.agent.command, "claude-code-acp");
        assert_eq!(config.agent.args, vec!["--stdio".to_string()]);
        assert_eq!(config.agent.env_allowlist, vec!["ANTHROPIC_API_KEY".to_string()]);
        assert_eq!(config.resume_policy, ResumePolicy::AlwaysRespawn);
    }

    #[test]
    fn pass_env_is_comma_separated() {
        let cli = Cli::parse_from(["ook-bridge", "--pass-env", "A, B,,C", "agent"]);
        let spec = cli.agent().unwrap();
        assert_eq!(spec.env_allowlist, vec!["A", "B", "C"]);
    }

    #[test]
    fn grace_and_resume_flags() {
        let cli = Cli::parse_from([
            "ook-bridge",
            "--terminate-grace-secs",
            "2",
            "--resume-authenticated",
            "agent",
        ]);
        let config = cli.bridge_config().unwrap();
        assert_eq!(config.agent.terminate_grace_ms, 2_000);
        assert_eq!(config.resume_policy, ResumePolicy::ResumeAuthenticated);
    }

    #[test]
    fn log_format_maps_to_telemetry() {
        assert_eq!(LogFormat::from(LogFormatArg::Pretty), LogFormat::Pretty);
        let cli = Cli::parse_from(["ook-bridge", "--log-format", "pretty", "agent"]);
        assert!(matches!(cli.log_format, LogFormatArg::Pretty));
    }
}
