use tracing::{debug, error, info, trace, warn};

use super::{emit, CloseReason, EndpointEvent, EndpointState, EventSender};
use crate::config::{OverflowPolicy, SessionConfig};
use crate::error::{EndpointError, HeaderFault, PoolError, ProtocolError, TransportError};
use crate::pool::{PoolView, SlotIndex, SlotState};
use crate::setup::decode_setup;
use crate::surface::SurfaceHandle;
use crate::transport::Transport;
use crate::wire::{peek_header, HandoffMessage, Message, MessageKind, PeerId};

type FrameCallback = Box<dyn FnMut(SlotIndex, &SurfaceHandle) + Send>;

/// Outcome of one successfully handled message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    SetupComplete { slot_count: usize },
    /// The display callback ran for this slot
    Frame { slot: SlotIndex },
}

/// Receives the producer's surfaces once, then displays announced slots.
pub struct Consumer<T: Transport> {
    config: SessionConfig,
    transport: T,
    on_frame: FrameCallback,
    events: EventSender,
    state: EndpointState,
    view: Option<PoolView>,
    peer: Option<PeerId>,
    violations: u32,
}

impl<T: Transport> Consumer<T> {
    /// `on_frame` runs for every validated swap; the host calls
    /// [`Consumer::release`] once it has consumed the frame.
    pub fn new<F>(config: SessionConfig, transport: T, on_frame: F, events: EventSender) -> Result<Self, EndpointError>
    where
        F: FnMut(SlotIndex, &SurfaceHandle) + Send + 'static,
    {
        config.validate()?;
        Ok(Self {
            config,
            transport,
            on_frame: Box::new(on_frame),
            events,
            state: EndpointState::Uninitialized,
            view: None,
            peer: None,
            violations: 0,
        })
    }

    pub fn state(&self) -> EndpointState {
        self.state
    }

    pub fn view(&self) -> Option<&PoolView> {
        self.view.as_ref()
    }

    /// Producer identity learned from the setup message.
    pub fn peer(&self) -> Option<PeerId> {
        self.peer
    }

    pub fn start(&mut self) -> Result<(), EndpointError> {
        match self.state {
            EndpointState::Uninitialized => {
                self.state = EndpointState::AwaitingSetup;
                debug!("Consumer awaiting setup for {} slots", self.config.slot_count);
                Ok(())
            }
            EndpointState::Closed => Err(EndpointError::SessionClosed),
            other => Err(EndpointError::InvalidState(other)),
        }
    }

    /// Block for the next message and handle it.
    ///
    /// Rejected messages come back as errors while the session stays open;
    /// check [`Consumer::state`] to tell whether the session survived.
    pub fn poll(&mut self) -> Result<Delivery, EndpointError> {
        self.ensure_open()?;
        let msg = match self.transport.receive() {
            Ok(msg) => msg,
            // Only that one datagram was lost; the channel is still usable
            Err(TransportError::Truncated) => {
                let error = ProtocolError::OversizedMessage;
                return Err(match self.state {
                    EndpointState::AwaitingSetup => self.reject_setup(error),
                    _ => self.discard(error),
                });
            }
            Err(e) => {
                warn!("Consumer receive failed: {}", e);
                self.enter_closed(CloseReason::Transport(e.to_string()));
                return Err(e.into());
            }
        };
        self.handle_message(msg)
    }

    /// Handle one already-received message.
    pub fn handle_message(&mut self, msg: Message) -> Result<Delivery, EndpointError> {
        self.ensure_open()?;
        match self.state {
            EndpointState::AwaitingSetup => self.on_setup_phase(msg),
            _ => self.on_ready(msg),
        }
    }

    /// The host is done with a displayed slot. Local only, so it also
    /// works after the transport has died.
    pub fn release(&mut self, slot: SlotIndex) -> Result<(), EndpointError> {
        let view = self.view.as_mut().ok_or(EndpointError::InvalidState(self.state))?;
        view.release(slot)?;
        Ok(())
    }

    pub fn close(&mut self) {
        if let Some(view) = self.view.as_mut() {
            view.retire_all();
        }
        self.enter_closed(CloseReason::Local);
    }

    fn ensure_open(&self) -> Result<(), EndpointError> {
        match self.state {
            EndpointState::AwaitingSetup | EndpointState::Ready => Ok(()),
            EndpointState::Closed => Err(EndpointError::SessionClosed),
            other => Err(EndpointError::InvalidState(other)),
        }
    }

    fn on_setup_phase(&mut self, msg: Message) -> Result<Delivery, EndpointError> {
        if let Ok(header) = peek_header(&msg.bytes) {
            if header.kind == MessageKind::Swap {
                return Err(self.violation("swap received before setup".into()));
            }
        }

        // Anything else is taken as the setup; if it is malformed no pool view can exist
        let setup = match decode_setup(msg, self.config.slot_count) {
            Ok(setup) => setup,
            Err(e) => return Err(self.reject_setup(e)),
        };

        let slot_count = setup.surfaces.len();
        self.view = Some(PoolView::from_handles(setup.surfaces));
        self.peer = Some(setup.peer);
        self.state = EndpointState::Ready;

        info!("Setup received from peer {}: {} surfaces, consumer ready", setup.peer, slot_count);
        emit(&self.events, EndpointEvent::SetupReceived {
            peer: setup.peer,
            slot_count,
        });
        Ok(Delivery::SetupComplete { slot_count })
    }

    fn on_ready(&mut self, msg: Message) -> Result<Delivery, EndpointError> {
        let message = match HandoffMessage::decode(msg, self.config.slot_count) {
            Ok(message) => message,
            Err(e) => return Err(self.discard(e)),
        };
        trace!("Received {:?} from peer {}", message.kind(), message.peer());

        if let Some(expected) = self.peer {
            if message.peer() != expected {
                return Err(self.discard(
                    HeaderFault::PeerMismatch {
                        expected,
                        found: message.peer(),
                    }
                    .into(),
                ));
            }
        }

        let swap = match message {
            HandoffMessage::Swap(swap) => swap,
            // Handles of the duplicate are closed as it drops
            HandoffMessage::Setup(_) => return Err(self.violation("duplicate setup".into())),
        };

        let view = self.view.as_mut().ok_or(EndpointError::InvalidState(self.state))?;
        match view.mark_ready(swap.slot) {
            Ok(()) => {}
            Err(PoolError::InvalidTransition {
                from: SlotState::InFlight,
                ..
            }) => match self.config.overflow {
                OverflowPolicy::DropOldest => {
                    debug!("Slot {} reused before release, previous frame dropped", swap.slot);
                    emit(&self.events, EndpointEvent::FrameDropped { slot: swap.slot });
                }
                OverflowPolicy::Stall => {
                    return Err(self.violation(format!("slot {} announced while still in flight", swap.slot)));
                }
            },
            Err(e) => return Err(e.into()),
        }

        if let Some(surface) = self.view.as_ref().and_then(|v| v.handle(swap.slot)) {
            (self.on_frame)(swap.slot, surface);
        }
        Ok(Delivery::Frame { slot: swap.slot })
    }

    /// A setup that cannot be used ends the session before it starts.
    fn reject_setup(&mut self, error: ProtocolError) -> EndpointError {
        error!("Rejected setup: {}", error);
        self.enter_closed(CloseReason::SetupRejected(error.clone()));
        error.into()
    }

    /// Report and drop a single bad message; the session stays up.
    fn discard(&mut self, error: ProtocolError) -> EndpointError {
        warn!("Discarding message: {}", error);
        emit(&self.events, EndpointEvent::MessageDiscarded(error.clone()));
        error.into()
    }

    /// Report an out-of-order message, closing once the tolerance is exceeded.
    fn violation(&mut self, reason: String) -> EndpointError {
        let error = ProtocolError::ProtocolViolation(reason);
        self.violations += 1;
        warn!("Protocol violation #{}: {}", self.violations, error);
        emit(&self.events, EndpointEvent::ProtocolViolation {
            count: self.violations,
            error: error.clone(),
        });

        if self.violations > self.config.max_protocol_violations {
            self.enter_closed(CloseReason::TooManyViolations(self.violations));
        }
        error.into()
    }

    fn enter_closed(&mut self, reason: CloseReason) {
        if self.state == EndpointState::Closed {
            return;
        }
        info!("Consumer closed: {:?}", reason);
        self.state = EndpointState::Closed;
        self.transport.close();
        emit(&self.events, EndpointEvent::Closed(reason));
    }
}
