use std::time::Duration;

use studybuddy_llm::BoxFuture;
use tokio::time::Instant;

/// Roughly one 60 Hz display refresh.
pub const DEFAULT_FRAME_INTERVAL: Duration = Duration::from_millis(16);

/// Source of display-refresh opportunities.
pub trait FrameClock: Send + Sync {
    /// Resolves at the next refresh boundary.
    fn next_frame(&self) -> BoxFuture<'static, ()>;
}

/// Ticks at a fixed rate aligned to the clock's own epoch, so every waiter scheduled inside
/// one interval wakes on the same boundary.
#[derive(Debug, Clone)]
pub struct FixedRateFrameClock {
    epoch: Instant,
    interval: Duration,
}

impl Default for FixedRateFrameClock {
    fn default() -> Self {
        Self::new(DEFAULT_FRAME_INTERVAL)
    }
}

impl FixedRateFrameClock {
    pub fn new(interval: Duration) -> Self {
        Self {
            epoch: Instant::now(),
            interval: interval.max(Duration::from_millis(1)),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// First frame boundary strictly after `now`.
    pub fn next_deadline(&self, now: Instant) -> Instant {
        let interval_nanos = self.interval.as_nanos();
        let elapsed_nanos = now.saturating_duration_since(self.epoch).as_nanos();
        let frames = elapsed_nanos / interval_nanos + 1;
        let offset = u64::try_from(frames * interval_nanos)
            .map(Duration::from_nanos)
            .unwrap_or(Duration::MAX);

        self.epoch
            .checked_add(offset)
            .unwrap_or_else(|| now + self.interval)
    }
}

impl FrameClock for FixedRateFrameClock {
    fn next_frame(&self) -> BoxFuture<'static, ()> {
        let deadline = self.next_deadline(Instant::now());
        Box::pin(tokio::time::sleep_until(deadline))
    }
}
