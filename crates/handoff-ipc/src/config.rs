//! Session parameters both endpoints must agree on.

use serde::{Deserialize, Serialize};

use crate::error::EndpointError;
use crate::pool::SurfaceSpec;
use crate::surface::PixelFormat;
use crate::wire::MAX_SLOTS;

/// What the producer does when every slot is leased or in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Report `NoWritableSlot`; the caller polls, sleeps, or skips the frame
    #[default]
    Stall,
    /// Reuse the oldest in-flight slot, dropping the frame it carried
    DropOldest,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Pool size N, fixed for the session
    pub slot_count: usize,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub overflow: OverflowPolicy,
    /// Out-of-order messages tolerated before the consumer closes the session
    pub max_protocol_violations: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            slot_count: 3,
            width: 1280,
            height: 720,
            format: PixelFormat::Xrgb8888,
            overflow: OverflowPolicy::Stall,
            max_protocol_violations: 1,
        }
    }
}

impl SessionConfig {
    pub fn validate(&self) -> Result<(), EndpointError> {
        if self.slot_count == 0 || self.slot_count > MAX_SLOTS {
            return Err(EndpointError::Config(format!(
                "slot_count must be in 1..={}, got {}",
                MAX_SLOTS, self.slot_count
            )));
        }
        if self.width == 0 || self.height == 0 {
            return Err(EndpointError::Config(format!(
                "surface dimensions must be non-zero, got {}x{}",
                self.width, self.height
            )));
        }
        Ok(())
    }

    pub fn surface_spec(&self) -> SurfaceSpec {
        SurfaceSpec {
            width: self.width,
            height: self.height,
            format: self.format,
        }
    }
}
