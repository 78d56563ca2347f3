//! Handoff IPC Protocol
//!
//! Cross-process surface handoff between a producer, which draws into a
//! small rotating pool of shared surfaces, and a consumer, which displays
//! them. Surface handles cross the process boundary once, in a setup
//! message; after that each completed frame is announced by a small swap
//! message naming the ready slot. Pixel data is never copied.

pub mod config;
pub mod endpoint;
pub mod error;
pub mod pool;
pub mod setup;
pub mod surface;
pub mod swap;
pub mod transport;
pub mod wire;

pub use config::{OverflowPolicy, SessionConfig};
pub use endpoint::{
    event_channel, CloseReason, Consumer, Delivery, EndpointEvent, EndpointState, EventReceiver, EventSender,
    FrameTarget, Producer,
};
pub use error::{AllocError, EndpointError, HeaderFault, PoolError, ProtocolError, TransportError};
pub use pool::{PoolView, SlotIndex, SlotState, SurfacePool, SurfaceSpec};
pub use surface::{Access, MemfdAllocator, PixelFormat, SurfaceAllocator, SurfaceDesc, SurfaceHandle};
pub use transport::{MemoryTransport, SeqPacketTransport, Transport};
pub use wire::{HandoffMessage, Message, MessageKind, PeerId};

/// Environment variable through which a spawned consumer learns its socket fd.
pub const SOCKET_FD_ENV: &str = "HANDOFF_SOCKET_FD";
