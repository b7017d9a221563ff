use rand::Rng;
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;

/// Pacing for retry-bounded remote operations: at most `attempts` tries with a
/// uniformly random delay in `[min_delay, max_delay]` between them. The jitter
/// keeps concurrent pairs from hammering the venue in lockstep.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub min_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(attempts: u32, min_delay_secs: f64, max_delay_secs: f64) -> Self {
        let min = min_delay_secs.max(0.0);
        let max = max_delay_secs.max(min);
        Self {
            attempts: attempts.max(1),
            min_delay: Duration::from_secs_f64(min),
            max_delay: Duration::from_secs_f64(max),
        }
    }

    pub fn jittered_delay(&self) -> Duration {
        if self.max_delay <= self.min_delay {
            return self.min_delay;
        }
        rand::thread_rng().gen_range(self.min_delay..=self.max_delay)
    }

    /// Sleeps a jittered delay, returning false if cancelled mid-wait.
    pub async fn pause(&self, cancel: &CancellationToken) -> bool {
        wait(self.jittered_delay(), cancel).await
    }
}

/// Cancellation-aware sleep; false means the token fired first.
pub async fn wait(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = sleep(duration) => true,
    }
}
