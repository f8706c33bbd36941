//! Wire-level types shared by the bridge server and the passthrough client.

pub mod close;
pub mod framing;
pub mod ids;
pub mod rpc;

pub use close::CloseReason;
pub use framing::ensure_newline;
pub use ids::{PeerId, ProcessId};
pub use rpc::{Envelope, RequestId};

/// Port the bridge listens on and the passthrough client dials by default.
pub const DEFAULT_PORT: u16 = 8647;
