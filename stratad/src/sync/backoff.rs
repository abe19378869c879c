use rand::Rng;
use std::time::Duration;

/// Exponential delay capped at `max`, optionally with full jitter.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    jitter: bool,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration, jitter: bool) -> Self {
        Self { base, max, jitter }
    }

    /// Between attempts of a single transfer.
    pub fn for_jobs() -> Self {
        Self::new(Duration::from_millis(250), Duration::from_secs(10), true)
    }

    /// Before re-running a sync state left in the error phase. Not jittered so
    /// the supervisor sees a stable deadline across ticks.
    pub fn for_runs() -> Self {
        Self::new(Duration::from_secs(5), Duration::from_secs(300), false)
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let mut rng = rand::thread_rng();
        self.delay_with_rng(attempt, &mut rng)
    }

    pub fn delay_with_rng<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let base_ms = self.base.as_millis().min(u128::from(u64::MAX)) as u64;
        let max_ms = self.max.as_millis().min(u128::from(u64::MAX)) as u64;
        let ceiling = base_ms.saturating_mul(1u64 << attempt.min(16)).min(max_ms);
        if self.jitter {
            Duration::from_millis(rng.gen_range(0..=ceiling))
        } else {
            Duration::from_millis(ceiling)
        }
    }
}
