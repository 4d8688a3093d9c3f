//! Request pacing: a shared token bucket, or a no-op when no rate is set.
//!
//! The bucket hands out tokens through a semaphore whose waiters queue in
//! FIFO order, which gives first-come-first-served fairness across workers.
//! A background ticker tops the bucket up to its capacity every interval;
//! tokens do not accumulate across idle intervals.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Base refill interval. Doubled as needed so that every tick is worth at
/// least one whole token.
pub const RATE_LIMIT_INTERVAL: Duration = Duration::from_millis(10);

/// Outcome of a pacing call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pace {
    Continue,
    Break,
}

pub enum RateLimiter {
    Bucket(BucketLimiter),
    Noop,
}

pub struct BucketLimiter {
    tokens: Arc<Semaphore>,
    interval: Duration,
    quantum: u64,
}

impl RateLimiter {
    /// A token bucket targeting `rate` requests per second. The bucket
    /// starts full.
    pub fn bucket(rate: u64) -> Self {
        let (interval, quantum) = estimate(rate, RATE_LIMIT_INTERVAL);
        Self::Bucket(BucketLimiter {
            tokens: Arc::new(Semaphore::new(quantum as usize)),
            interval,
            quantum,
        })
    }

    pub fn noop() -> Self {
        Self::Noop
    }

    /// The refill interval, if this limiter has one. The throughput sampler
    /// aligns its cadence with this to avoid oversampling zeros.
    pub fn interval(&self) -> Option<Duration> {
        match self {
            Self::Bucket(b) => Some(b.interval),
            Self::Noop => None,
        }
    }

    /// Spawn the refill ticker. It stops when the done-signal closes.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self, done: CancellationToken) {
        let Self::Bucket(bucket) = self else {
            return;
        };
        let tokens = Arc::clone(&bucket.tokens);
        let quantum = bucket.quantum as usize;
        let mut ticker = tokio::time::interval(bucket.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tokio::spawn(async move {
            // The first tick of an interval completes immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = done.cancelled() => break,
                    _ = ticker.tick() => {
                        let available = tokens.available_permits();
                        if available < quantum {
                            tokens.add_permits(quantum - available);
                        }
                    }
                }
            }
        });
    }

    /// Block until a token is available or the done-signal closes, whichever
    /// comes first. `Break` is returned only for the done-signal.
    pub async fn pace(&self, done: &CancellationToken) -> Pace {
        match self {
            Self::Noop => {
                if done.is_cancelled() {
                    Pace::Break
                } else {
                    Pace::Continue
                }
            }
            Self::Bucket(bucket) => {
                tokio::select! {
                    _ = done.cancelled() => Pace::Break,
                    permit = bucket.tokens.acquire() => match permit {
                        Ok(permit) => {
                            permit.forget();
                            Pace::Continue
                        }
                        Err(_) => Pace::Break,
                    },
                }
            }
        }
    }
}

/// Pick a refill interval and per-tick token count whose ratio matches the
/// requested rate, doubling the interval until a tick is worth at least one
/// token.
fn estimate(rate: u64, base: Duration) -> (Duration, u64) {
    let mut interval = base;
    let mut quantum = tokens_per_tick(rate, interval);
    while quantum == 0 {
        interval *= 2;
        quantum = tokens_per_tick(rate, interval);
    }
    (interval, quantum)
}

fn tokens_per_tick(rate: u64, interval: Duration) -> u64 {
    (rate as u128 * interval.as_nanos() / 1_000_000_000) as u64
}
