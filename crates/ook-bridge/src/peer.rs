//! The session's view of a connected WebSocket peer.

use ook_core::{CloseReason, PeerId};
use tokio::sync::mpsc;

/// Instructions for a peer's connection task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerCommand {
    /// Send one text frame.
    Send(String),
    /// Send a close frame with this reason and stop.
    Close(CloseReason),
}

/// Sending half of a peer connection.
///
/// The connection task owns the socket; this handle only queues commands.
/// Once the task is gone, or [`PeerHandle::close`] has been called, the
/// peer is no longer open.
#[derive(Debug)]
pub struct PeerHandle {
    id: PeerId,
    tx: mpsc::UnboundedSender<PeerCommand>,
    closed: bool,
}

impl PeerHandle {
    pub fn new(id: PeerId, tx: mpsc::UnboundedSender<PeerCommand>) -> Self {
        Self { id, tx, closed: false }
    }

    /// A handle plus the receiver its connection task would drain.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<PeerCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(PeerId::new(), tx), rx)
    }

    pub fn id(&self) -> &PeerId {
        &self.id
    }

    pub fn is_open(&self) -> bool {
        !self.closed && !self.tx.is_closed()
    }

    /// Queue a text frame. Returns `false` if the peer is not open.
    pub fn send(&self, text: impl Into<String>) -> bool {
        if !self.is_open() {
            return false;
        }
        self.tx.send(PeerCommand::Send(text.into())).is_ok()
    }

    /// Close the peer. Only the first close is delivered.
    pub fn close(&mut self, reason: CloseReason) {
        if self.closed {
            return;
        }
        self.closed = true;
        let _ = self.tx.send(PeerCommand::Close(reason));
    }
}
