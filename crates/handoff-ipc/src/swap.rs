//! Swap channel codec.
//!
//! One swap per completed frame: `WireHeader` + a 32-bit slot index. There
//! is no sequence number or acknowledgement; ordering relies on the
//! transport delivering each channel in order, exactly once.

use bytemuck::{Pod, Zeroable};

use crate::error::ProtocolError;
use crate::pool::SlotIndex;
use crate::wire::{expect_exact_len, expect_header, read_pod, Message, MessageKind, PeerId, WireHeader};

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct SwapBody {
    slot: u32,
}

/// Total size of an encoded swap.
pub const SWAP_MESSAGE_SIZE: usize = WireHeader::SIZE + std::mem::size_of::<SwapBody>();

/// Decoded swap: slot `slot` is ready for the consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapMessage {
    pub peer: PeerId,
    pub slot: SlotIndex,
}

pub fn encode_swap(peer: PeerId, slot: SlotIndex) -> Message {
    // Saturate so an unrepresentable index stays out of range instead of wrapping onto a real slot
    let slot = u32::try_from(slot).unwrap_or(u32::MAX);
    let mut bytes = Vec::with_capacity(SWAP_MESSAGE_SIZE);
    bytes.extend_from_slice(bytemuck::bytes_of(&WireHeader::new(MessageKind::Swap, peer)));
    bytes.extend_from_slice(bytemuck::bytes_of(&SwapBody { slot }));
    Message::new(bytes, Vec::new())
}

/// Decode a swap for a pool of `slot_count` slots.
pub fn decode_swap(msg: Message, slot_count: usize) -> Result<SwapMessage, ProtocolError> {
    let header = expect_header(&msg.bytes, MessageKind::Swap)?;

    // Swaps never carry handles; any that arrive are closed with the message
    if !msg.handles.is_empty() {
        return Err(ProtocolError::HandleCountMismatch {
            expected: 0,
            actual: msg.handles.len(),
        });
    }

    let body: SwapBody = read_pod(&msg.bytes, WireHeader::SIZE)?;
    expect_exact_len(&msg.bytes, SWAP_MESSAGE_SIZE)?;

    if body.slot as usize >= slot_count {
        return Err(ProtocolError::IndexOutOfRange {
            index: body.slot,
            slot_count,
        });
    }

    Ok(SwapMessage {
        peer: header.peer,
        slot: body.slot as SlotIndex,
    })
}
