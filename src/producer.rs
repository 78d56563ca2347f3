//! Producer side of the demo: draws frames into the pool and hands them off

use anyhow::{Context, Result};
use handoff_ipc::{
    event_channel, EndpointError, MemfdAllocator, OverflowPolicy, PoolError, Producer, SurfaceDesc, SurfaceHandle,
};
use std::collections::VecDeque;
use std::fs::File;
use std::os::fd::AsFd;
use std::os::unix::fs::FileExt;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::launcher;

/// CPU painter standing in for a real renderer
struct Painter {
    canvases: Vec<File>,
    scratch: Vec<u8>,
}

impl Painter {
    fn new(surfaces: impl Iterator<Item = Result<File>>) -> Result<Self> {
        Ok(Self {
            canvases: surfaces.collect::<Result<_>>()?,
            scratch: Vec::new(),
        })
    }

    /// Fill the whole surface with a color derived from the frame number
    fn draw(&mut self, slot: usize, desc: &SurfaceDesc, frame: u64) -> Result<()> {
        let bpp = (desc.stride / desc.width.max(1)).max(1) as usize;
        let color = frame_color(frame).to_le_bytes();

        self.scratch.resize(desc.size as usize, 0);
        for px in self.scratch.chunks_exact_mut(bpp) {
            px.copy_from_slice(&color[..bpp]);
        }

        let canvas = self.canvases.get(slot).context("No canvas for slot")?;
        canvas
            .write_all_at(&self.scratch, 0)
            .with_context(|| format!("Failed to draw into slot {}", slot))
    }
}

/// XRGB color cycling with the frame number
fn frame_color(frame: u64) -> u32 {
    let phase = (frame % 256) as u32;
    0xff00_0000 | phase << 16 | (255 - phase) << 8 | ((frame as u32).wrapping_mul(7) & 0xff)
}

fn canvas_for(surface: &SurfaceHandle) -> Result<File> {
    let fd = surface
        .as_fd()
        .try_clone_to_owned()
        .context("Failed to duplicate surface fd")?;
    Ok(File::from(fd))
}

pub async fn run(config: Config, mut shutdown: mpsc::Receiver<()>) -> Result<()> {
    let (transport, mut consumer_process) = launcher::spawn_consumer()?;

    let (events_tx, events_rx) = event_channel();
    tokio::spawn(crate::log_events("producer", events_rx));

    let mut producer = Producer::new(config.session.clone(), transport, events_tx)?;
    producer
        .create_session(&MemfdAllocator)
        .context("Failed to establish handoff session")?;

    let pool = producer.pool().context("Session has no pool")?;
    let mut painter = Painter::new((0..pool.len()).map(|slot| {
        pool.handle(slot)
            .context("Missing slot handle")
            .and_then(canvas_for)
    }))?;
    let descs: Vec<SurfaceDesc> = (0..pool.len())
        .filter_map(|slot| pool.handle(slot).map(|h| *h.desc()))
        .collect();

    let retain = config.retain_frames();
    let mut presented: VecDeque<usize> = VecDeque::new();
    let mut ticker = tokio::time::interval(Duration::from_millis(config.demo.frame_interval_ms.max(1)));
    let mut frame: u64 = 0;
    let mut stalls: u64 = 0;

    info!(
        "Producing {} frames every {} ms ({:?} on overflow)",
        if config.demo.frames == 0 { "unlimited".to_string() } else { config.demo.frames.to_string() },
        config.demo.frame_interval_ms,
        config.session.overflow
    );

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.recv() => {
                info!("Shutdown requested after {} frames", frame);
                break;
            }
        }

        if config.demo.frames != 0 && frame >= config.demo.frames {
            break;
        }

        let slot = match producer.begin_frame() {
            Ok(target) => target.slot,
            Err(EndpointError::Pool(PoolError::NoWritableSlot)) => {
                stalls += 1;
                debug!("No writable slot, skipping tick");
                continue;
            }
            Err(e) => {
                warn!("Session ended: {}", e);
                break;
            }
        };

        if let Err(e) = painter.draw(slot, &descs[slot], frame) {
            warn!("{:#}", e);
            producer.cancel_frame(slot)?;
            continue;
        }

        if let Err(e) = producer.present(slot) {
            warn!("Failed to present slot {}: {}", slot, e);
            break;
        }
        frame += 1;

        // Without acknowledgements, assume the consumer is done after a fixed latency
        if config.session.overflow == OverflowPolicy::Stall {
            presented.push_back(slot);
            while presented.len() > retain {
                if let Some(old) = presented.pop_front() {
                    producer.release(old)?;
                }
            }
        }
    }

    info!("Produced {} frames ({} stalled ticks)", frame, stalls);
    producer.close();

    tokio::task::spawn_blocking(move || consumer_process.wait())
        .await
        .context("Consumer wait task failed")??;

    Ok(())
}
