//! Setup channel codec.
//!
//! The setup message is sent once per session and moves one surface handle
//! per pool slot from producer to consumer.
//!
//! Layout: `WireHeader` + `SetupBody` + `[SlotDescriptor; slot_count]`,
//! with `slot_count` descriptors attached as transport handles in slot order.

use std::mem;
use std::os::fd::{AsRawFd, OwnedFd};

use bytemuck::{Pod, Zeroable};
use tracing::debug;

use crate::error::ProtocolError;
use crate::surface::{Access, SurfaceDesc, SurfaceHandle};
use crate::wire::{expect_exact_len, expect_header, read_pod, Message, MessageKind, PeerId, WireHeader};

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct SetupBody {
    slot_count: u32,
}

/// Per-slot surface metadata; the matching handle travels out of band.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct SlotDescriptor {
    width: u32,
    height: u32,
    stride: u32,
    fourcc: u32,
    size: u64,
}

const BODY_OFFSET: usize = WireHeader::SIZE;
const DESCRIPTORS_OFFSET: usize = BODY_OFFSET + mem::size_of::<SetupBody>();

impl From<&SurfaceDesc> for SlotDescriptor {
    fn from(desc: &SurfaceDesc) -> Self {
        Self {
            width: desc.width,
            height: desc.height,
            stride: desc.stride,
            fourcc: desc.fourcc,
            size: desc.size,
        }
    }
}

impl From<SlotDescriptor> for SurfaceDesc {
    fn from(d: SlotDescriptor) -> Self {
        Self {
            width: d.width,
            height: d.height,
            stride: d.stride,
            fourcc: d.fourcc,
            size: d.size,
        }
    }
}

/// Decoded setup: the sender's identity and one display-only handle per slot.
#[derive(Debug, PartialEq)]
pub struct SetupMessage {
    pub peer: PeerId,
    pub surfaces: Vec<SurfaceHandle>,
}

/// Build the setup message. The handle list has exactly `handles.len()` entries.
pub fn encode_setup(peer: PeerId, handles: Vec<SurfaceHandle>) -> Message {
    let mut bytes = Vec::with_capacity(DESCRIPTORS_OFFSET + handles.len() * mem::size_of::<SlotDescriptor>());
    bytes.extend_from_slice(bytemuck::bytes_of(&WireHeader::new(MessageKind::Setup, peer)));
    // Saturated counts never match the handle list, so decoding rejects them
    bytes.extend_from_slice(bytemuck::bytes_of(&SetupBody {
        slot_count: u32::try_from(handles.len()).unwrap_or(u32::MAX),
    }));
    for handle in &handles {
        bytes.extend_from_slice(bytemuck::bytes_of(&SlotDescriptor::from(handle.desc())));
    }

    let fds: Vec<OwnedFd> = handles.into_iter().map(SurfaceHandle::into_fd).collect();
    debug!("Encoded setup: {} bytes, fds {:?}", bytes.len(), fds.iter().map(|f| f.as_raw_fd()).collect::<Vec<_>>());

    Message::new(bytes, fds)
}

/// Decode a setup message for a pool of `expected` slots.
///
/// Only structure is checked: kind tag, handle count, declared slot count,
/// and body length. Handles are taken as-is. On failure every received
/// handle is closed.
pub fn decode_setup(msg: Message, expected: usize) -> Result<SetupMessage, ProtocolError> {
    let header = expect_header(&msg.bytes, MessageKind::Setup)?;

    if msg.handles.len() != expected {
        return Err(ProtocolError::HandleCountMismatch {
            expected,
            actual: msg.handles.len(),
        });
    }

    let body: SetupBody = read_pod(&msg.bytes, BODY_OFFSET)?;
    if body.slot_count as usize != expected {
        return Err(ProtocolError::HandleCountMismatch {
            expected,
            actual: body.slot_count as usize,
        });
    }

    let descriptors = (0..expected)
        .map(|i| read_pod::<SlotDescriptor>(&msg.bytes, DESCRIPTORS_OFFSET + i * mem::size_of::<SlotDescriptor>()))
        .collect::<Result<Vec<_>, _>>()?;
    expect_exact_len(&msg.bytes, DESCRIPTORS_OFFSET + expected * mem::size_of::<SlotDescriptor>())?;

    let surfaces = msg
        .handles
        .into_iter()
        .zip(descriptors)
        .map(|(fd, d)| SurfaceHandle::new(fd, d.into(), Access::ReadOnly))
        .collect();

    Ok(SetupMessage {
        peer: header.peer,
        surfaces,
    })
}
