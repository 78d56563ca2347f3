//! Consumer side of the demo: displays handed-off surfaces

use anyhow::{Context, Result};
use handoff_ipc::{event_channel, Consumer, Delivery, EndpointState, SlotIndex, SurfaceHandle};
use std::fs::File;
use std::os::fd::AsFd;
use std::os::unix::fs::FileExt;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

use crate::config::Config;
use crate::fps::FpsCounter;
use crate::launcher;

/// Stand-in for a display: samples the first pixel of each frame
struct Display {
    /// Read-only views of each slot, opened on first use
    views: Vec<Option<File>>,
    fps: FpsCounter,
}

impl Display {
    fn new(slot_count: usize, report_interval: Duration) -> Self {
        Self {
            views: (0..slot_count).map(|_| None).collect(),
            fps: FpsCounter::new(report_interval),
        }
    }

    fn show(&mut self, slot: SlotIndex, surface: &SurfaceHandle) {
        match self.first_pixel(slot, surface) {
            Ok(pixel) => trace!("Slot {} first pixel {:#010x}", slot, pixel),
            Err(e) => warn!("Failed to sample slot {}: {:#}", slot, e),
        }

        if let Some(fps) = self.fps.tick() {
            info!("Displaying at {:.1} FPS", fps);
        }
    }

    fn first_pixel(&mut self, slot: SlotIndex, surface: &SurfaceHandle) -> Result<u32> {
        let entry = self.views.get_mut(slot).context("Slot outside display table")?;
        if entry.is_none() {
            let fd = surface
                .as_fd()
                .try_clone_to_owned()
                .context("Failed to duplicate surface fd")?;
            *entry = Some(File::from(fd));
        }
        let view = entry.as_ref().context("Slot view missing")?;

        let mut pixel = [0u8; 4];
        view.read_exact_at(&mut pixel, 0).context("Failed to read surface")?;
        Ok(u32::from_le_bytes(pixel))
    }
}

pub async fn run(config: Config) -> Result<()> {
    let transport = launcher::inherited_transport()?;

    let (events_tx, events_rx) = event_channel();
    tokio::spawn(crate::log_events("consumer", events_rx));

    let mut display = Display::new(
        config.session.slot_count,
        Duration::from_millis(config.demo.fps_report_ms.max(1)),
    );
    let mut consumer = Consumer::new(
        config.session.clone(),
        transport,
        move |slot, surface: &SurfaceHandle| display.show(slot, surface),
        events_tx,
    )?;
    consumer.start()?;

    // Receiving blocks, so the protocol loop runs off the async workers
    let frames = tokio::task::spawn_blocking(move || {
        let mut frames: u64 = 0;
        loop {
            match consumer.poll() {
                Ok(Delivery::SetupComplete { slot_count }) => {
                    info!("Session established with {} surfaces", slot_count);
                }
                Ok(Delivery::Frame { slot }) => {
                    frames += 1;
                    if let Err(e) = consumer.release(slot) {
                        warn!("Failed to release slot {}: {}", slot, e);
                    }
                }
                Err(e) if consumer.state() == EndpointState::Closed => {
                    info!("Session ended: {}", e);
                    break;
                }
                Err(e) => debug!("Message rejected: {}", e),
            }
        }
        frames
    })
    .await
    .context("Consumer task failed")?;

    info!("Displayed {} frames", frames);
    Ok(())
}
