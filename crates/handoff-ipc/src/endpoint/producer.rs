use tracing::{debug, error, info, trace, warn};

use super::{emit, CloseReason, EndpointEvent, EndpointState, EventSender};
use crate::config::{OverflowPolicy, SessionConfig};
use crate::error::{EndpointError, PoolError};
use crate::pool::{SlotIndex, SurfacePool};
use crate::setup::encode_setup;
use crate::surface::{SurfaceAllocator, SurfaceHandle};
use crate::swap::encode_swap;
use crate::transport::Transport;
use crate::wire::{local_peer_id, Message, PeerId};

/// A slot leased for drawing. Draw into `surface`, then call
/// [`Producer::present`] or [`Producer::cancel_frame`] with `slot`.
#[derive(Debug)]
pub struct FrameTarget<'a> {
    pub slot: SlotIndex,
    pub surface: &'a SurfaceHandle,
}

/// Owns the surface pool and announces ready slots to the consumer.
pub struct Producer<T: Transport> {
    config: SessionConfig,
    transport: T,
    events: EventSender,
    state: EndpointState,
    pool: Option<SurfacePool>,
    peer: PeerId,
}

impl<T: Transport> Producer<T> {
    pub fn new(config: SessionConfig, transport: T, events: EventSender) -> Result<Self, EndpointError> {
        config.validate()?;
        Ok(Self {
            config,
            transport,
            events,
            state: EndpointState::Uninitialized,
            pool: None,
            peer: local_peer_id(),
        })
    }

    pub fn state(&self) -> EndpointState {
        self.state
    }

    pub fn pool(&self) -> Option<&SurfacePool> {
        self.pool.as_ref()
    }

    /// Allocate the pool and send the one setup message.
    pub fn create_session(&mut self, allocator: &dyn SurfaceAllocator) -> Result<(), EndpointError> {
        match self.state {
            EndpointState::Uninitialized => {}
            EndpointState::Closed => return Err(EndpointError::SessionClosed),
            other => return Err(EndpointError::InvalidState(other)),
        }

        let pool = match SurfacePool::create(self.config.slot_count, self.config.surface_spec(), allocator) {
            Ok(pool) => pool,
            Err(e) => {
                error!("Session start failed: {}", e);
                self.enter_closed(CloseReason::SetupFailed(e.to_string()));
                return Err(e.into());
            }
        };
        self.state = EndpointState::SendingSetup;

        let handles = match pool.export_handles() {
            Ok(handles) => handles,
            Err(e) => {
                error!("Failed to export surfaces: {}", e);
                self.enter_closed(CloseReason::SetupFailed(e.to_string()));
                return Err(e.into());
            }
        };
        self.pool = Some(pool);

        self.send(encode_setup(self.peer, handles))?;

        self.state = EndpointState::Ready;
        info!("Setup sent: {} surfaces, producer ready", self.config.slot_count);
        emit(&self.events, EndpointEvent::SetupSent {
            slot_count: self.config.slot_count,
        });
        Ok(())
    }

    /// Lease the next writable slot for drawing.
    ///
    /// With [`OverflowPolicy::Stall`] a full pool yields `NoWritableSlot`;
    /// with [`OverflowPolicy::DropOldest`] the oldest in-flight frame is
    /// dropped and its slot reused.
    pub fn begin_frame(&mut self) -> Result<FrameTarget<'_>, EndpointError> {
        self.ensure_ready()?;
        let pool = self.pool.as_mut().ok_or(EndpointError::InvalidState(self.state))?;

        let slot = match pool.acquire_for_write() {
            Ok(slot) => slot,
            Err(PoolError::NoWritableSlot) => {
                let reclaimed = match self.config.overflow {
                    OverflowPolicy::Stall => None,
                    OverflowPolicy::DropOldest => pool.reclaim_oldest(),
                };
                match reclaimed {
                    Some(dropped) => {
                        debug!("Dropping in-flight frame in slot {}", dropped);
                        emit(&self.events, EndpointEvent::FrameDropped { slot: dropped });
                        pool.acquire_for_write()?
                    }
                    None => {
                        trace!("Producer stalled: no writable slot");
                        emit(&self.events, EndpointEvent::ProducerStalled);
                        return Err(PoolError::NoWritableSlot.into());
                    }
                }
            }
            Err(e) => return Err(e.into()),
        };

        let surface = pool.handle(slot).ok_or(PoolError::SlotOutOfRange {
            slot,
            slot_count: self.config.slot_count,
        })?;
        Ok(FrameTarget { slot, surface })
    }

    /// Mark a drawn slot ready and announce it.
    pub fn present(&mut self, slot: SlotIndex) -> Result<(), EndpointError> {
        self.ensure_ready()?;
        let pool = self.pool.as_mut().ok_or(EndpointError::InvalidState(self.state))?;
        pool.mark_ready(slot)?;

        self.send(encode_swap(self.peer, slot))?;
        trace!("Presented slot {}", slot);
        emit(&self.events, EndpointEvent::FramePresented { slot });
        Ok(())
    }

    /// Give back a leased slot without presenting it.
    pub fn cancel_frame(&mut self, slot: SlotIndex) -> Result<(), EndpointError> {
        let pool = self.pool.as_mut().ok_or(EndpointError::InvalidState(self.state))?;
        pool.cancel_write(slot)?;
        Ok(())
    }

    /// Return an in-flight slot to the writable set once the host knows the
    /// consumer is done with it. Local only, so it also works after the
    /// transport has died.
    pub fn release(&mut self, slot: SlotIndex) -> Result<(), EndpointError> {
        let pool = self.pool.as_mut().ok_or(EndpointError::InvalidState(self.state))?;
        pool.release(slot)?;
        Ok(())
    }

    /// End the session and retire every slot.
    pub fn close(&mut self) {
        if let Some(pool) = self.pool.as_mut() {
            pool.retire_all();
        }
        self.enter_closed(CloseReason::Local);
    }

    fn ensure_ready(&self) -> Result<(), EndpointError> {
        match self.state {
            EndpointState::Ready => Ok(()),
            EndpointState::Closed => Err(EndpointError::SessionClosed),
            other => Err(EndpointError::InvalidState(other)),
        }
    }

    fn send(&mut self, msg: Message) -> Result<(), EndpointError> {
        if let Err(e) = self.transport.send(msg) {
            warn!("Producer send failed: {}", e);
            self.enter_closed(CloseReason::Transport(e.to_string()));
            return Err(e.into());
        }
        Ok(())
    }

    fn enter_closed(&mut self, reason: CloseReason) {
        if self.state == EndpointState::Closed {
            return;
        }
        info!("Producer closed: {:?}", reason);
        self.state = EndpointState::Closed;
        self.transport.close();
        emit(&self.events, EndpointEvent::Closed(reason));
    }
}
