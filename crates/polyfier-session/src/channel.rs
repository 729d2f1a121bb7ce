//! Outbound half of a peer connection.

use tokio::sync::mpsc;

use crate::error::{SessionError, SessionResult};
use crate::message::ServerMessage;

/// Identifier of one physical connection.
pub type SessionId = u64;

/// Cloneable sender bound to a connection. The transport drains the paired
/// receiver into the socket.
#[derive(Debug, Clone)]
pub struct ChannelHandle {
    session_id: SessionId,
    tx: mpsc::UnboundedSender<String>,
}

impl ChannelHandle {
    pub fn new(session_id: SessionId, tx: mpsc::UnboundedSender<String>) -> Self {
        Self { session_id, tx }
    }

    /// A handle plus the receiver the transport should drain.
    pub fn pair(session_id: SessionId) -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(session_id, tx), rx)
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn send(&self, message: &ServerMessage) -> SessionResult<()> {
        self.send_raw(message.to_json()?)
    }

    pub fn send_raw(&self, frame: String) -> SessionResult<()> {
        self.tx.send(frame).map_err(|_| SessionError::ChannelClosed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
