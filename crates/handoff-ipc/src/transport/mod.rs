//! Transport adapter: ordered, point-to-point delivery of messages that
//! carry bytes plus transferable handles.
//!
//! Implementations must deliver each channel in order and exactly once; the
//! protocol does not re-implement either guarantee. A closed peer is
//! reported as [`TransportError::PeerClosed`] from `send` or `receive`.

mod memory;
mod seqpacket;

pub use memory::MemoryTransport;
pub use seqpacket::SeqPacketTransport;

use crate::error::TransportError;
use crate::wire::Message;

pub trait Transport: Send {
    /// Send one message; its handles are transferred to the peer.
    fn send(&mut self, msg: Message) -> Result<(), TransportError>;

    /// Block until the next message arrives.
    fn receive(&mut self) -> Result<Message, TransportError>;

    /// Close the local end. The peer observes `PeerClosed`.
    fn close(&mut self);

    fn is_closed(&self) -> bool;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn send(&mut self, msg: Message) -> Result<(), TransportError> {
        (**self).send(msg)
    }

    fn receive(&mut self) -> Result<Message, TransportError> {
        (**self).receive()
    }

    fn close(&mut self) {
        (**self).close()
    }

    fn is_closed(&self) -> bool {
        (**self).is_closed()
    }
}
