//! Single-tenant bridge between one WebSocket peer and one NDJSON stdio agent
//! process.
//!
//! Frames from the peer are written verbatim to the agent's stdin, one per
//! line; lines from the agent's stdout are sent back verbatim as text frames.
//! Along the way the bridge correlates JSON-RPC requests with their responses
//! for latency metrics and spans, and tracks whether the `initialize`
//! handshake has succeeded.

pub mod config;
pub mod error;
pub mod health;
pub mod peer;
pub mod process;
pub mod server;
pub mod session;
pub mod shutdown;
pub mod websocket;

pub use config::{BridgeConfig, ProcessSpec, ResumePolicy, DEFAULT_PORT};
pub use error::{ProcessError, ServerError};
pub use peer::{PeerCommand, PeerHandle};
pub use process::{ExitInfo, ProcessController, ProcessEvent};
pub use server::{BridgeServer, ServerHandle};
pub use session::{SessionController, SessionEvent, SessionStatus};
pub use shutdown::ShutdownCoordinator;
