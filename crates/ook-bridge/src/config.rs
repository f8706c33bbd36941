//! Bridge configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use ook_core::DEFAULT_PORT;

/// Parent environment variables handed to the agent by default.
pub const DEFAULT_ENV_ALLOWLIST: &[&str] = &["ANTHROPIC_API_KEY"];

/// Method whose successful response marks the session authenticated.
pub const DEFAULT_HANDSHAKE_METHOD: &str = "initialize";

/// What happens to the agent process when its peer goes away.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResumePolicy {
    /// Kill the process on every disconnect and spawn a fresh one for every
    /// admitted peer.
    #[default]
    AlwaysRespawn,
    /// Keep an authenticated process alive across a disconnect and reattach
    /// the next admitted peer to it.
    ResumeAuthenticated,
}

/// How to launch the agent process.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProcessSpec {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Names of parent environment variables copied into the child. Nothing
    /// else from the parent environment is inherited.
    #[serde(default = "default_env_allowlist")]
    pub env_allowlist: Vec<String>,
    /// Time between SIGTERM and SIGKILL when terminating.
    #[serde(default = "default_terminate_grace_ms")]
    pub terminate_grace_ms: u64,
}

impl ProcessSpec {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
            env_allowlist: default_env_allowlist(),
            terminate_grace_ms: default_terminate_grace_ms(),
        }
    }

    pub fn terminate_grace(&self) -> Duration {
        Duration::from_millis(self.terminate_grace_ms)
    }
}

fn default_env_allowlist() -> Vec<String> {
    DEFAULT_ENV_ALLOWLIST.iter().map(|s| s.to_string()).collect()
}

fn default_terminate_grace_ms() -> u64 {
    5_000
}

/// Configuration for the bridge server.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Host to bind (default `"0.0.0.0"`).
    pub host: String,
    /// Port to bind (`0` picks a free port).
    pub port: u16,
    pub agent: ProcessSpec,
    pub handshake_method: String,
    pub resume_policy: ResumePolicy,
    /// Interval between WebSocket pings to the peer.
    pub heartbeat_interval_secs: u64,
}

impl BridgeConfig {
    pub fn new(agent: ProcessSpec) -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: DEFAULT_PORT,
            agent,
            handshake_method: DEFAULT_HANDSHAKE_METHOD.into(),
            resume_policy: ResumePolicy::default(),
            heartbeat_interval_secs: 30,
        }
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }
}
