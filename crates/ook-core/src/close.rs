//! Peer-visible WebSocket close codes.

/// Why the bridge closed a peer connection. Each variant owns a distinct
/// code/reason pair.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CloseReason {
    /// Another peer already holds the session.
    Busy,
    /// The agent process failed to start or reported an error.
    ProcessError,
    /// The agent process exited.
    ProcessExited,
    /// The bridge is stopping.
    ShuttingDown,
}

impl CloseReason {
    pub const ALL: [CloseReason; 4] = [
        CloseReason::Busy,
        CloseReason::ProcessError,
        CloseReason::ProcessExited,
        CloseReason::ShuttingDown,
    ];

    pub fn code(self) -> u16 {
        match self {
            Self::Busy => 4000,
            Self::ProcessError => 4001,
            Self::ProcessExited => 4002,
            Self::ShuttingDown => 1001,
        }
    }

    pub fn reason(self) -> &'static str {
        match self {
            Self::Busy => "Server busy: single-user mode",
            Self::ProcessError => "Agent process error",
            Self::ProcessExited => "Agent process exited",
            Self::ShuttingDown => "Server shutting down",
        }
    }

    /// Map a received close code back to its reason, if it is one of ours.
    pub fn from_code(code: u16) -> Option<Self> {
        Self::ALL.into_iter().find(|r| r.code() == code)
    }
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.reason(), self.code())
    }
}
