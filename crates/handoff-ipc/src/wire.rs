//! Message framing shared by the setup and swap codecs.
//!
//! # Protocol Overview
//!
//! Every message is one transport datagram:
//! - Header: [`WireHeader`] (magic, version, kind, sender peer id)
//! - Body: kind-specific fixed-size fields
//! - Handles: transferable surface descriptors (setup only)
//!
//! Both peers are local processes on one host, so scalar fields use native
//! byte order. Nothing is trusted: tag, length, and bounds are checked before
//! a typed message is built.

use std::mem;
use std::os::fd::OwnedFd;

use bytemuck::{Pod, Zeroable};

use crate::error::{HeaderFault, ProtocolError};
use crate::setup::{decode_setup, SetupMessage};
use crate::swap::{decode_swap, SwapMessage};

/// "HNDF"
pub const MAGIC: u32 = u32::from_le_bytes(*b"HNDF");
pub const VERSION: u16 = 1;

/// Upper bound on pool size, equal to the per-message handle limit.
pub const MAX_SLOTS: usize = 16;

/// Identity of the sending process, used to route replies and reject strays.
pub type PeerId = u32;

/// Peer id of the calling process.
pub fn local_peer_id() -> PeerId {
    std::process::id()
}

/// Message kind tag carried in every header.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Setup = 1,
    Swap = 2,
}

impl MessageKind {
    fn from_tag(tag: u16) -> Result<Self, HeaderFault> {
        match tag {
            1 => Ok(MessageKind::Setup),
            2 => Ok(MessageKind::Swap),
            other => Err(HeaderFault::UnknownKind(other)),
        }
    }
}

/// On-wire header layout.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub(crate) struct WireHeader {
    pub magic: u32,
    pub version: u16,
    pub kind: u16,
    pub peer: u32,
}

impl WireHeader {
    pub const SIZE: usize = mem::size_of::<Self>();

    pub fn new(kind: MessageKind, peer: PeerId) -> Self {
        Self {
            magic: MAGIC,
            version: VERSION,
            kind: kind as u16,
            peer,
        }
    }
}

/// Validated header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub kind: MessageKind,
    pub peer: PeerId,
}

/// Raw transport unit: a byte body plus transferable resources.
#[derive(Debug, Default)]
pub struct Message {
    pub bytes: Vec<u8>,
    pub handles: Vec<OwnedFd>,
}

impl Message {
    pub fn new(bytes: Vec<u8>, handles: Vec<OwnedFd>) -> Self {
        Self { bytes, handles }
    }
}

/// Read a Pod value at `offset`, or report how many bytes were needed.
pub(crate) fn read_pod<T: Pod>(bytes: &[u8], offset: usize) -> Result<T, ProtocolError> {
    let needed = offset + mem::size_of::<T>();
    if bytes.len() < needed {
        return Err(ProtocolError::TruncatedPayload {
            needed,
            actual: bytes.len(),
        });
    }
    Ok(bytemuck::pod_read_unaligned(&bytes[offset..needed]))
}

/// Validate magic, version, and kind tag.
pub fn peek_header(bytes: &[u8]) -> Result<MessageHeader, ProtocolError> {
    let raw: WireHeader = read_pod(bytes, 0)?;
    if raw.magic != MAGIC {
        return Err(HeaderFault::BadMagic(raw.magic).into());
    }
    if raw.version != VERSION {
        return Err(HeaderFault::UnsupportedVersion(raw.version).into());
    }
    Ok(MessageHeader {
        kind: MessageKind::from_tag(raw.kind)?,
        peer: raw.peer,
    })
}

/// Validate the header and require a specific kind.
pub(crate) fn expect_header(bytes: &[u8], expected: MessageKind) -> Result<MessageHeader, ProtocolError> {
    let header = peek_header(bytes)?;
    if header.kind != expected {
        return Err(HeaderFault::WrongKind {
            expected,
            found: header.kind,
        }
        .into());
    }
    Ok(header)
}

/// Reject bytes past the end of a fixed-size message.
pub(crate) fn expect_exact_len(bytes: &[u8], len: usize) -> Result<(), ProtocolError> {
    if bytes.len() > len {
        return Err(ProtocolError::TrailingBytes {
            extra: bytes.len() - len,
        });
    }
    Ok(())
}

/// A decoded protocol message.
#[derive(Debug, PartialEq)]
pub enum HandoffMessage {
    Setup(SetupMessage),
    Swap(SwapMessage),
}

impl HandoffMessage {
    /// Dispatch on the header tag and decode against a pool of `slot_count` slots.
    pub fn decode(msg: Message, slot_count: usize) -> Result<Self, ProtocolError> {
        match peek_header(&msg.bytes)?.kind {
            MessageKind::Setup => decode_setup(msg, slot_count).map(HandoffMessage::Setup),
            MessageKind::Swap => decode_swap(msg, slot_count).map(HandoffMessage::Swap),
        }
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            HandoffMessage::Setup(_) => MessageKind::Setup,
            HandoffMessage::Swap(_) => MessageKind::Swap,
        }
    }

    pub fn peer(&self) -> PeerId {
        match self {
            HandoffMessage::Setup(m) => m.peer,
            HandoffMessage::Swap(m) => m.peer,
        }
    }
}
