// Display-rate meter for the consumer
use std::time::{Duration, Instant};

/// Measures how fast handed-off frames reach the display.
///
/// Frames are counted over a window of at least `window`; each closed
/// window yields one rate sample.
pub struct FpsCounter {
    window: Duration,
    window_start: Instant,
    shown: u32,
}

impl FpsCounter {
    pub fn new(window: Duration) -> Self {
        Self::starting_at(window, Instant::now())
    }

    fn starting_at(window: Duration, now: Instant) -> Self {
        Self {
            window,
            window_start: now,
            shown: 0,
        }
    }

    /// Record one displayed frame; returns the rate when a window closes.
    pub fn tick(&mut self) -> Option<f64> {
        self.frame_shown_at(Instant::now())
    }

    fn frame_shown_at(&mut self, now: Instant) -> Option<f64> {
        self.shown += 1;

        let span = now.saturating_duration_since(self.window_start);
        if span < self.window {
            return None;
        }

        let rate = f64::from(self.shown) / span.as_secs_f64();
        self.window_start = now;
        self.shown = 0;
        Some(rate)
    }
}
