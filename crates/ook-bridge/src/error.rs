/// Failures starting or wiring the agent process. Surfaced as process error
/// events, never returned to the caller of `spawn`.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("agent {0} pipe unavailable")]
    MissingPipe(&'static str),
}

impl ProcessError {
    /// Short classification string for logging/metrics.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Spawn { .. } => "spawn_failed",
            Self::MissingPipe(_) => "missing_pipe",
        }
    }
}

/// Failures bringing up the HTTP/WebSocket listener.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to read local address: {0}")]
    LocalAddr(#[source] std::io::Error),
    #[error("session controller is not running")]
    ControllerGone,
}
