//! Producer and consumer protocol state machines.
//!
//! ```text
//! producer: Uninitialized -> SendingSetup -> Ready -> Closed
//! consumer: Uninitialized -> AwaitingSetup -> Ready -> Closed
//! ```
//!
//! Each endpoint exclusively owns its transport and its pool (or pool view),
//! so every pool mutation and send on one endpoint is serialized through
//! `&mut self`. Hosts that drive an endpoint from several threads wrap it
//! in a mutex.

mod consumer;
mod producer;

pub use consumer::{Consumer, Delivery};
pub use producer::{FrameTarget, Producer};

use tokio::sync::mpsc;

use crate::error::ProtocolError;
use crate::pool::SlotIndex;
use crate::wire::PeerId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointState {
    Uninitialized,
    /// Producer: pool allocated, setup not yet confirmed sent
    SendingSetup,
    /// Consumer: waiting for the producer's setup
    AwaitingSetup,
    Ready,
    /// Terminal
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The host closed this endpoint
    Local,
    /// The transport failed or the peer went away
    Transport(String),
    /// Surfaces could not be allocated or exported
    SetupFailed(String),
    /// A malformed setup arrived; no pool view can exist
    SetupRejected(ProtocolError),
    /// Out-of-order messages exceeded the configured tolerance
    TooManyViolations(u32),
}

/// Degradations and milestones reported to the host embedding an endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndpointEvent {
    SetupSent { slot_count: usize },
    SetupReceived { peer: PeerId, slot_count: usize },
    FramePresented { slot: SlotIndex },
    /// A frame was overwritten before the consumer released it
    FrameDropped { slot: SlotIndex },
    /// No writable slot; the producer must wait for a release
    ProducerStalled,
    /// A single message failed validation and was thrown away
    MessageDiscarded(ProtocolError),
    ProtocolViolation { count: u32, error: ProtocolError },
    Closed(CloseReason),
}

pub type EventSender = mpsc::UnboundedSender<EndpointEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<EndpointEvent>;

pub fn event_channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}

fn emit(events: &EventSender, event: EndpointEvent) {
    // Ignore error if the host dropped its receiver
    let _ = events.send(event);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{OverflowPolicy, SessionConfig};
    use crate::error::{AllocError, EndpointError, PoolError, TransportError};
    use crate::pool::{SlotState, SurfacePool};
    use crate::setup::encode_setup;
    use crate::surface::{Access, MemfdAllocator, PixelFormat, SurfaceAllocator, SurfaceHandle};
    use crate::swap::encode_swap;
    use crate::transport::{MemoryTransport, SeqPacketTransport, Transport};
    use crate::wire::{local_peer_id, Message};
    use std::os::fd::AsFd;
    use std::os::unix::fs::FileExt;
    use std::sync::{Arc, Mutex};

    fn config(slot_count: usize, overflow: OverflowPolicy) -> SessionConfig {
        SessionConfig {
            slot_count,
            width: 8,
            height: 4,
            format: PixelFormat::Xrgb8888,
            overflow,
            max_protocol_violations: 1,
        }
    }

    type Seen = Arc<Mutex<Vec<SlotIndex>>>;

    fn consumer<T: Transport>(config: SessionConfig, transport: T) -> (Consumer<T>, Seen, EventReceiver) {
        let seen: Seen = Arc::default();
        let sink = seen.clone();
        let (tx, rx) = event_channel();
        let mut consumer = Consumer::new(
            config,
            transport,
            move |slot, _surface: &SurfaceHandle| sink.lock().unwrap().push(slot),
            tx,
        )
        .unwrap();
        consumer.start().unwrap();
        (consumer, seen, rx)
    }

    fn producer<T: Transport>(config: SessionConfig, transport: T) -> (Producer<T>, EventReceiver) {
        let (tx, rx) = event_channel();
        let mut producer = Producer::new(config, transport, tx).unwrap();
        producer.create_session(&MemfdAllocator).unwrap();
        (producer, rx)
    }

    fn drain(rx: &mut EventReceiver) -> Vec<EndpointEvent> {
        std::iter::from_fn(|| rx.try_recv().ok()).collect()
    }

    fn present_next<T: Transport>(producer: &mut Producer<T>) -> SlotIndex {
        let slot = producer.begin_frame().unwrap().slot;
        producer.present(slot).unwrap();
        slot
    }

    #[test]
    fn test_setup_then_frames() {
        let (pt, ct) = MemoryTransport::pair();
        let (mut producer, mut prx) = producer(config(3, OverflowPolicy::Stall), pt);
        let (mut consumer, seen, mut crx) = consumer(config(3, OverflowPolicy::Stall), ct);

        assert_eq!(producer.state(), EndpointState::Ready);
        assert_eq!(consumer.state(), EndpointState::AwaitingSetup);

        assert_eq!(consumer.poll().unwrap(), Delivery::SetupComplete { slot_count: 3 });
        assert_eq!(consumer.state(), EndpointState::Ready);
        assert_eq!(consumer.peer(), Some(local_peer_id()));

        for _ in 0..3 {
            let slot = present_next(&mut producer);
            assert_eq!(consumer.poll().unwrap(), Delivery::Frame { slot });
            consumer.release(slot).unwrap();
            producer.release(slot).unwrap();
        }

        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2]);
        assert_eq!(drain(&mut prx)[0], EndpointEvent::SetupSent { slot_count: 3 });
        assert_eq!(
            drain(&mut crx),
            vec![EndpointEvent::SetupReceived {
                peer: local_peer_id(),
                slot_count: 3
            }]
        );
    }

    #[test]
    fn test_swap_before_setup_is_tolerated_once() {
        let (mut raw, ct) = MemoryTransport::pair();
        let (mut consumer, seen, mut crx) = consumer(config(2, OverflowPolicy::Stall), ct);

        let mut pool = SurfacePool::create(2, config(2, OverflowPolicy::Stall).surface_spec(), &MemfdAllocator).unwrap();
        let slot = pool.acquire_for_write().unwrap();
        pool.mark_ready(slot).unwrap();
        raw.send(encode_swap(local_peer_id(), slot)).unwrap();

        let err = consumer.poll().unwrap_err();
        assert!(matches!(err, EndpointError::Protocol(ProtocolError::ProtocolViolation(_))));
        assert_eq!(consumer.state(), EndpointState::AwaitingSetup);
        assert!(matches!(
            drain(&mut crx).as_slice(),
            [EndpointEvent::ProtocolViolation { count: 1, .. }]
        ));

        raw.send(encode_setup(local_peer_id(), pool.export_handles().unwrap())).unwrap();
        assert_eq!(consumer.poll().unwrap(), Delivery::SetupComplete { slot_count: 2 });
        assert_eq!(consumer.state(), EndpointState::Ready);
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_repeated_violations_close_session() {
        let (mut raw, ct) = MemoryTransport::pair();
        let (mut consumer, _seen, mut crx) = consumer(config(2, OverflowPolicy::Stall), ct);

        raw.send(encode_swap(local_peer_id(), 0)).unwrap();
        raw.send(encode_swap(local_peer_id(), 1)).unwrap();
        assert!(consumer.poll().is_err());
        assert_eq!(consumer.state(), EndpointState::AwaitingSetup);
        assert!(consumer.poll().is_err());
        assert_eq!(consumer.state(), EndpointState::Closed);

        assert_eq!(
            drain(&mut crx).last(),
            Some(&EndpointEvent::Closed(CloseReason::TooManyViolations(2)))
        );
        assert!(matches!(consumer.poll(), Err(EndpointError::SessionClosed)));
    }

    #[test]
    fn test_short_setup_never_reaches_ready() {
        let (pt, ct) = MemoryTransport::pair();
        // Producer compiled with 2 slots, consumer with 3
        let (_producer, _prx) = producer(config(2, OverflowPolicy::Stall), pt);
        let (mut consumer, _seen, mut crx) = consumer(config(3, OverflowPolicy::Stall), ct);

        let err = consumer.poll().unwrap_err();
        assert!(matches!(
            err,
            EndpointError::Protocol(ProtocolError::HandleCountMismatch { expected: 3, actual: 2 })
        ));
        assert_eq!(consumer.state(), EndpointState::Closed);
        assert!(consumer.view().is_none());
        assert!(matches!(
            drain(&mut crx).as_slice(),
            [EndpointEvent::Closed(CloseReason::SetupRejected(ProtocolError::HandleCountMismatch { .. }))]
        ));
    }

    #[test]
    fn test_producer_stalls_without_release() {
        let (pt, _ct) = MemoryTransport::pair();
        let (mut producer, mut prx) = producer(config(2, OverflowPolicy::Stall), pt);

        present_next(&mut producer);
        present_next(&mut producer);
        assert!(matches!(
            producer.begin_frame(),
            Err(EndpointError::Pool(PoolError::NoWritableSlot))
        ));
        assert_eq!(producer.state(), EndpointState::Ready);
        assert_eq!(drain(&mut prx).last(), Some(&EndpointEvent::ProducerStalled));

        producer.release(0).unwrap();
        assert_eq!(producer.begin_frame().unwrap().slot, 0);
    }

    #[test]
    fn test_drop_oldest_reuses_in_flight_slot() {
        let (pt, ct) = MemoryTransport::pair();
        let (mut producer, mut prx) = producer(config(2, OverflowPolicy::DropOldest), pt);
        let (mut consumer, seen, mut crx) = consumer(config(2, OverflowPolicy::DropOldest), ct);
        consumer.poll().unwrap();

        assert_eq!(present_next(&mut producer), 0);
        assert_eq!(present_next(&mut producer), 1);
        assert_eq!(present_next(&mut producer), 0);
        assert!(drain(&mut prx).contains(&EndpointEvent::FrameDropped { slot: 0 }));

        for _ in 0..3 {
            consumer.poll().unwrap();
        }
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 0]);
        assert!(drain(&mut crx).contains(&EndpointEvent::FrameDropped { slot: 0 }));
        assert_eq!(consumer.view().unwrap().state(0), Some(SlotState::InFlight));
    }

    #[test]
    fn test_duplicate_swap_is_violation_when_stalling() {
        let (mut raw, ct) = MemoryTransport::pair();
        let (mut consumer, seen, _crx) = consumer(config(2, OverflowPolicy::Stall), ct);
        let pool = SurfacePool::create(2, config(2, OverflowPolicy::Stall).surface_spec(), &MemfdAllocator).unwrap();
        raw.send(encode_setup(local_peer_id(), pool.export_handles().unwrap())).unwrap();
        consumer.poll().unwrap();

        raw.send(encode_swap(local_peer_id(), 1)).unwrap();
        raw.send(encode_swap(local_peer_id(), 1)).unwrap();
        consumer.poll().unwrap();
        assert!(matches!(
            consumer.poll(),
            Err(EndpointError::Protocol(ProtocolError::ProtocolViolation(_)))
        ));
        assert_eq!(consumer.state(), EndpointState::Ready);
        assert_eq!(*seen.lock().unwrap(), vec![1]);
    }

    #[test]
    fn test_corrupt_message_discarded_in_ready() {
        let (mut raw, ct) = MemoryTransport::pair();
        let (mut consumer, seen, mut crx) = consumer(config(2, OverflowPolicy::Stall), ct);
        let pool = SurfacePool::create(2, config(2, OverflowPolicy::Stall).surface_spec(), &MemfdAllocator).unwrap();
        raw.send(encode_setup(local_peer_id(), pool.export_handles().unwrap())).unwrap();
        consumer.poll().unwrap();
        drain(&mut crx);

        raw.send(encode_swap(local_peer_id(), 5)).unwrap();
        raw.send(Message::new(vec![1, 2, 3], Vec::new())).unwrap();
        raw.send(encode_swap(local_peer_id() + 1, 0)).unwrap();
        raw.send(encode_swap(local_peer_id(), 0)).unwrap();

        assert!(matches!(
            consumer.poll(),
            Err(EndpointError::Protocol(ProtocolError::IndexOutOfRange { index: 5, slot_count: 2 }))
        ));
        assert!(matches!(
            consumer.poll(),
            Err(EndpointError::Protocol(ProtocolError::TruncatedPayload { .. }))
        ));
        assert!(matches!(
            consumer.poll(),
            Err(EndpointError::Protocol(ProtocolError::MalformedHeader(_)))
        ));
        assert_eq!(consumer.poll().unwrap(), Delivery::Frame { slot: 0 });
        assert_eq!(consumer.state(), EndpointState::Ready);
        assert_eq!(*seen.lock().unwrap(), vec![0]);

        let discarded = drain(&mut crx)
            .into_iter()
            .filter(|e| matches!(e, EndpointEvent::MessageDiscarded(_)))
            .count();
        assert_eq!(discarded, 3);
    }

    #[test]
    fn test_duplicate_setup_in_ready() {
        let (pt, ct) = MemoryTransport::pair();
        let (_producer, _prx) = producer(config(2, OverflowPolicy::Stall), pt);
        let (mut consumer, _seen, _crx) = consumer(config(2, OverflowPolicy::Stall), ct);
        consumer.poll().unwrap();

        let pool = SurfacePool::create(2, config(2, OverflowPolicy::Stall).surface_spec(), &MemfdAllocator).unwrap();
        let msg = encode_setup(local_peer_id(), pool.export_handles().unwrap());
        assert!(matches!(
            consumer.handle_message(msg),
            Err(EndpointError::Protocol(ProtocolError::ProtocolViolation(_)))
        ));
        assert_eq!(consumer.state(), EndpointState::Ready);
    }

    #[test]
    fn test_peer_close_drives_consumer_closed() {
        let (pt, ct) = MemoryTransport::pair();
        let (mut producer, _prx) = producer(config(2, OverflowPolicy::Stall), pt);
        let (mut consumer, _seen, mut crx) = consumer(config(2, OverflowPolicy::Stall), ct);
        consumer.poll().unwrap();
        let slot = present_next(&mut producer);
        producer.close();
        assert_eq!(producer.state(), EndpointState::Closed);

        // Already-queued swap still arrives, then the close
        assert_eq!(consumer.poll().unwrap(), Delivery::Frame { slot });
        assert!(matches!(
            consumer.poll(),
            Err(EndpointError::Transport(TransportError::PeerClosed))
        ));
        assert_eq!(consumer.state(), EndpointState::Closed);
        assert!(matches!(consumer.poll(), Err(EndpointError::SessionClosed)));
        assert!(matches!(drain(&mut crx).last(), Some(EndpointEvent::Closed(CloseReason::Transport(_)))));

        // Local bookkeeping still completes after transport death
        consumer.release(slot).unwrap();
        assert_eq!(consumer.view().unwrap().state(slot), Some(SlotState::Writable));
    }

    #[test]
    fn test_producer_send_failure_closes() {
        let (pt, ct) = MemoryTransport::pair();
        let (mut producer, mut prx) = producer(config(2, OverflowPolicy::Stall), pt);
        drop(ct);

        let slot = producer.begin_frame().unwrap().slot;
        assert!(matches!(
            producer.present(slot),
            Err(EndpointError::Transport(TransportError::PeerClosed))
        ));
        assert_eq!(producer.state(), EndpointState::Closed);
        assert!(matches!(producer.begin_frame(), Err(EndpointError::SessionClosed)));
        assert!(matches!(drain(&mut prx).last(), Some(EndpointEvent::Closed(CloseReason::Transport(_)))));

        producer.release(slot).unwrap();
    }

    #[test]
    fn test_allocation_failure_prevents_session() {
        struct NoMemory;
        impl SurfaceAllocator for NoMemory {
            fn allocate(&self, _: u32, _: u32, _: PixelFormat) -> Result<SurfaceHandle, AllocError> {
                Err(AllocError::Os(nix::errno::Errno::ENOMEM))
            }
        }

        let (pt, _ct) = MemoryTransport::pair();
        let (tx, _rx) = event_channel();
        let mut producer = Producer::new(config(2, OverflowPolicy::Stall), pt, tx).unwrap();
        let err = producer.create_session(&NoMemory).unwrap_err();
        assert!(matches!(err, EndpointError::Pool(PoolError::AllocationFailed { slot: 0, .. })));
        assert_eq!(producer.state(), EndpointState::Closed);
        assert!(producer.pool().is_none());
    }

    #[test]
    fn test_operations_checked_against_state() {
        let (pt, ct) = MemoryTransport::pair();
        let (tx, _rx) = event_channel();
        let mut producer = Producer::new(config(2, OverflowPolicy::Stall), pt, tx).unwrap();
        assert!(matches!(
            producer.begin_frame(),
            Err(EndpointError::InvalidState(EndpointState::Uninitialized))
        ));

        let (tx, _rx) = event_channel();
        let mut consumer = Consumer::new(config(2, OverflowPolicy::Stall), ct, |_, _: &SurfaceHandle| {}, tx).unwrap();
        assert!(matches!(
            consumer.poll(),
            Err(EndpointError::InvalidState(EndpointState::Uninitialized))
        ));
        consumer.start().unwrap();
        assert!(consumer.start().is_err());
    }

    #[test]
    fn test_pixels_visible_across_socket_without_copy() {
        let (pt, ct) = SeqPacketTransport::pair().unwrap();
        let (mut producer, _prx) = producer(config(2, OverflowPolicy::Stall), pt);

        let seen: Arc<Mutex<Vec<u8>>> = Arc::default();
        let sink = seen.clone();
        let (tx, _rx) = event_channel();
        let mut consumer = Consumer::new(
            config(2, OverflowPolicy::Stall),
            ct,
            move |_slot, surface: &SurfaceHandle| {
                let file = std::fs::File::from(surface.as_fd().try_clone_to_owned().unwrap());
                let mut pixel = [0u8; 4];
                file.read_exact_at(&mut pixel, 0).unwrap();
                sink.lock().unwrap().extend_from_slice(&pixel);
            },
            tx,
        )
        .unwrap();
        consumer.start().unwrap();
        consumer.poll().unwrap();

        let target = producer.begin_frame().unwrap();
        let slot = target.slot;
        let file = std::fs::File::from(target.surface.as_fd().try_clone_to_owned().unwrap());
        file.write_all_at(&[0xaa, 0xbb, 0xcc, 0xff], 0).unwrap();
        producer.present(slot).unwrap();

        assert_eq!(consumer.poll().unwrap(), Delivery::Frame { slot });
        assert_eq!(*seen.lock().unwrap(), vec![0xaa, 0xbb, 0xcc, 0xff]);
    }

    #[test]
    fn test_oversized_datagram_discarded_over_socket() {
        let (mut raw, ct) = SeqPacketTransport::pair().unwrap();
        let (mut consumer, seen, mut crx) = consumer(config(2, OverflowPolicy::Stall), ct);
        let pool = SurfacePool::create(2, config(2, OverflowPolicy::Stall).surface_spec(), &MemfdAllocator).unwrap();
        raw.send(encode_setup(local_peer_id(), pool.export_handles().unwrap())).unwrap();
        consumer.poll().unwrap();
        drain(&mut crx);

        raw.send(Message::new(vec![0x5a; 5000], Vec::new())).unwrap();
        raw.send(encode_swap(local_peer_id(), 0)).unwrap();

        assert!(matches!(
            consumer.poll(),
            Err(EndpointError::Protocol(ProtocolError::OversizedMessage))
        ));
        assert_eq!(consumer.state(), EndpointState::Ready);
        assert_eq!(consumer.poll().unwrap(), Delivery::Frame { slot: 0 });
        assert_eq!(*seen.lock().unwrap(), vec![0]);
        assert_eq!(
            drain(&mut crx),
            vec![EndpointEvent::MessageDiscarded(ProtocolError::OversizedMessage)]
        );
    }

    #[test]
    fn test_oversized_first_message_rejects_setup() {
        let (mut raw, ct) = SeqPacketTransport::pair().unwrap();
        let (mut consumer, _seen, mut crx) = consumer(config(2, OverflowPolicy::Stall), ct);

        raw.send(Message::new(vec![0; 5000], Vec::new())).unwrap();
        assert!(matches!(
            consumer.poll(),
            Err(EndpointError::Protocol(ProtocolError::OversizedMessage))
        ));
        assert_eq!(consumer.state(), EndpointState::Closed);
        assert_eq!(
            drain(&mut crx),
            vec![EndpointEvent::Closed(CloseReason::SetupRejected(ProtocolError::OversizedMessage))]
        );
    }

    #[test]
    fn test_consumer_cannot_write_shared_surface() {
        let (pt, ct) = SeqPacketTransport::pair().unwrap();
        let (mut producer, _prx) = producer(config(2, OverflowPolicy::Stall), pt);

        let writes: Arc<Mutex<Vec<Option<i32>>>> = Arc::default();
        let sink = writes.clone();
        let (tx, _rx) = event_channel();
        let mut consumer = Consumer::new(
            config(2, OverflowPolicy::Stall),
            ct,
            move |_slot, surface: &SurfaceHandle| {
                let file = std::fs::File::from(surface.as_fd().try_clone_to_owned().unwrap());
                let result = file.write_at(&[0x11, 0x22], 0);
                sink.lock().unwrap().push(result.err().and_then(|e| e.raw_os_error()));
            },
            tx,
        )
        .unwrap();
        consumer.start().unwrap();
        consumer.poll().unwrap();
        assert_eq!(consumer.view().unwrap().handle(0).unwrap().access(), Access::ReadOnly);

        let target = producer.begin_frame().unwrap();
        let slot = target.slot;
        let canvas = std::fs::File::from(target.surface.as_fd().try_clone_to_owned().unwrap());
        canvas.write_all_at(&[0x33, 0x44], 0).unwrap();
        producer.present(slot).unwrap();
        consumer.poll().unwrap();

        assert_eq!(*writes.lock().unwrap(), vec![Some(libc::EBADF)]);
        let mut pixel = [0u8; 2];
        canvas.read_exact_at(&mut pixel, 0).unwrap();
        assert_eq!(pixel, [0x33, 0x44]);
    }
}
