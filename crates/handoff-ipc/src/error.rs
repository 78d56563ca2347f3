//! Error taxonomy for the handoff protocol.
//!
//! Pool and codec failures are returned as typed results to the endpoint
//! state machines, which decide locally whether an error ends the session.

use nix::errno::Errno;
use thiserror::Error;

use crate::pool::SlotState;
use crate::wire::MessageKind;

/// Failure reported by a [`SurfaceAllocator`](crate::surface::SurfaceAllocator).
#[derive(Debug, Error)]
pub enum AllocError {
    #[error("invalid surface dimensions {width}x{height}")]
    InvalidDimensions { width: u32, height: u32 },

    #[error("surface size overflows for {width}x{height}")]
    SizeOverflow { width: u32, height: u32 },

    #[error("os error: {0}")]
    Os(#[from] Errno),
}

/// Local flow-control and bookkeeping errors of a surface pool.
#[derive(Debug, Error)]
pub enum PoolError {
    /// Session start failed; no surfaces were kept.
    #[error("allocation failed for slot {slot}: {source}")]
    AllocationFailed {
        slot: usize,
        #[source]
        source: AllocError,
    },

    #[error("pool size must be at least 1")]
    EmptyPool,

    /// Every slot is leased or in flight; the producer is outrunning the consumer.
    #[error("no writable slot available")]
    NoWritableSlot,

    #[error("slot {slot} cannot go from {from:?} to {to:?}")]
    InvalidTransition {
        slot: usize,
        from: SlotState,
        to: SlotState,
    },

    #[error("slot {slot} out of range for pool of {slot_count}")]
    SlotOutOfRange { slot: usize, slot_count: usize },

    #[error("failed to export surface handle for slot {slot}: {source}")]
    Export {
        slot: usize,
        #[source]
        source: std::io::Error,
    },
}

/// Why a message header was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum HeaderFault {
    #[error("bad magic {0:#010x}")]
    BadMagic(u32),

    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u16),

    #[error("unknown message kind {0}")]
    UnknownKind(u16),

    #[error("expected {expected:?} message, found {found:?}")]
    WrongKind {
        expected: MessageKind,
        found: MessageKind,
    },

    #[error("message from peer {found}, session peer is {expected}")]
    PeerMismatch { expected: u32, found: u32 },
}

/// Per-message decode failures and ordering violations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("malformed header: {0}")]
    MalformedHeader(#[from] HeaderFault),

    #[error("expected {expected} handles, received {actual}")]
    HandleCountMismatch { expected: usize, actual: usize },

    #[error("payload truncated: need {needed} bytes, got {actual}")]
    TruncatedPayload { needed: usize, actual: usize },

    #[error("payload has {extra} trailing bytes")]
    TrailingBytes { extra: usize },

    /// The datagram or its handle list did not fit the receive limits.
    #[error("message exceeds receive limits and was cut short")]
    OversizedMessage,

    #[error("slot index {index} out of range for pool of {slot_count}")]
    IndexOutOfRange { index: u32, slot_count: usize },

    /// A well-formed message arrived in a state that does not accept it.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("peer closed the channel")]
    PeerClosed,

    #[error("transport closed locally")]
    Closed,

    #[error("message carries {count} handles, limit is {limit}")]
    TooManyHandles { count: usize, limit: usize },

    #[error("message or handle list truncated in transit")]
    Truncated,

    #[error("transport io error: {0}")]
    Io(#[from] Errno),
}

/// Errors surfaced by producer and consumer endpoints.
#[derive(Debug, Error)]
pub enum EndpointError {
    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("invalid session configuration: {0}")]
    Config(String),

    #[error("operation not valid in state {0:?}")]
    InvalidState(crate::endpoint::EndpointState),

    #[error("session closed")]
    SessionClosed,
}
