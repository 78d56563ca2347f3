//! In-process transport over unbounded channels.
//!
//! Handles move with the message, so a `MemoryTransport` pair behaves like
//! the socket transport without a kernel round-trip. Useful for embedding
//! both endpoints in one process and for tests.

use tokio::sync::mpsc;

use super::Transport;
use crate::error::TransportError;
use crate::wire::Message;

#[derive(Debug)]
pub struct MemoryTransport {
    tx: Option<mpsc::UnboundedSender<Message>>,
    rx: mpsc::UnboundedReceiver<Message>,
}

impl MemoryTransport {
    pub fn pair() -> (Self, Self) {
        let (a_tx, b_rx) = mpsc::unbounded_channel();
        let (b_tx, a_rx) = mpsc::unbounded_channel();
        (
            Self { tx: Some(a_tx), rx: a_rx },
            Self { tx: Some(b_tx), rx: b_rx },
        )
    }
}

impl Transport for MemoryTransport {
    fn send(&mut self, msg: Message) -> Result<(), TransportError> {
        let tx = self.tx.as_ref().ok_or(TransportError::Closed)?;
        tx.send(msg).map_err(|_| TransportError::PeerClosed)
    }

    /// Must not be called from inside an async runtime.
    fn receive(&mut self) -> Result<Message, TransportError> {
        if self.tx.is_none() {
            return Err(TransportError::Closed);
        }
        // Queued messages are still delivered after the peer closes
        self.rx.blocking_recv().ok_or(TransportError::PeerClosed)
    }

    fn close(&mut self) {
        self.tx = None;
        self.rx.close();
    }

    fn is_closed(&self) -> bool {
        self.tx.is_none()
    }
}
