//! Completion barrier: the single object that tells workers whether more
//! work remains and whether the run as a whole has finished.
//!
//! A run terminates either after a fixed number of requests (counted) or
//! after a wall-clock deadline (timed). Both variants share one done-signal,
//! a close-once cancellation token that also carries external cancellation
//! from a signal handler.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

pub struct CompletionBarrier {
    kind: Kind,
    token: CancellationToken,
}

enum Kind {
    Counted {
        total: u64,
        grabbed: AtomicU64,
        done: AtomicU64,
    },
    Timed {
        duration: Duration,
        start: Mutex<Instant>,
    },
}

impl CompletionBarrier {
    pub fn counted(total: u64) -> Self {
        Self {
            kind: Kind::Counted {
                total,
                grabbed: AtomicU64::new(0),
                done: AtomicU64::new(0),
            },
            token: CancellationToken::new(),
        }
    }

    pub fn timed(duration: Duration) -> Self {
        Self {
            kind: Kind::Timed {
                duration,
                start: Mutex::new(Instant::now()),
            },
            token: CancellationToken::new(),
        }
    }

    /// Start the clock. For timed runs this resets the elapsed baseline and
    /// spawns the one-shot deadline task; counted runs need no arming.
    ///
    /// Must be called from within a tokio runtime.
    pub fn arm(&self) {
        if let Kind::Timed { duration, start } = &self.kind {
            *start.lock().unwrap() = Instant::now();
            let duration = *duration;
            let token = self.token.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = token.cancelled() => {}
                    _ = tokio::time::sleep(duration) => token.cancel(),
                }
            });
        }
    }

    /// Claim one unit of work. Returns false once the done-signal is closed,
    /// or when a counted run has already handed out its full quota.
    ///
    /// The fetch-add can overshoot `total` by at most the worker count; the
    /// comparison against the pre-increment value discards the excess.
    pub fn try_grab_work(&self) -> bool {
        if self.token.is_cancelled() {
            return false;
        }
        match &self.kind {
            Kind::Counted { total, grabbed, .. } => {
                grabbed.fetch_add(1, Ordering::Relaxed) < *total
            }
            Kind::Timed { .. } => true,
        }
    }

    /// Report one unit of work finished. The counted variant closes the
    /// done-signal exactly once, when the final job completes.
    pub fn job_done(&self) {
        if let Kind::Counted { total, done, .. } = &self.kind
            && done.fetch_add(1, Ordering::Relaxed) + 1 == *total
        {
            self.token.cancel();
        }
    }

    /// Completed fraction in [0, 1]. Always 1.0 once the done-signal is
    /// closed, whatever closed it.
    pub fn completed(&self) -> f64 {
        if self.token.is_cancelled() {
            return 1.0;
        }
        match &self.kind {
            Kind::Counted { total, done, .. } => {
                if *total == 0 {
                    return 1.0;
                }
                (done.load(Ordering::Relaxed) as f64 / *total as f64).min(1.0)
            }
            Kind::Timed { duration, start } => {
                let elapsed = start.lock().unwrap().elapsed();
                (elapsed.as_secs_f64() / duration.as_secs_f64()).min(1.0)
            }
        }
    }

    /// Close the done-signal. Idempotent and callable from any thread,
    /// including a signal handler.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// A clone of the done-signal for tasks that select against it.
    pub fn done_token(&self) -> CancellationToken {
        self.token.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn counted_hands_out_exactly_total() {
        let total = 10_000u64;
        let barrier = Arc::new(CompletionBarrier::counted(total));

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let barrier = Arc::clone(&barrier);
            tasks.push(tokio::spawn(async move {
                let mut grabs = 0u64;
                while barrier.try_grab_work() {
                    grabs += 1;
                    barrier.job_done();
                }
                grabs
            }));
        }

        let mut grabs = 0u64;
        for task in tasks {
            grabs += task.await.unwrap();
        }
        assert_eq!(grabs, total);
        assert!(barrier.done_token().is_cancelled());
        assert!(!barrier.try_grab_work());
        assert_eq!(barrier.completed(), 1.0);
    }

    #[tokio::test]
    async fn counted_completed_is_monotonic() {
        let barrier = CompletionBarrier::counted(4);
        let mut last = barrier.completed();
        for _ in 0..4 {
            assert!(barrier.try_grab_work());
            barrier.job_done();
            let now = barrier.completed();
            assert!(now >= last);
            last = now;
        }
        assert_eq!(last, 1.0);
    }

    #[tokio::test]
    async fn cancel_is_idempotent_and_stops_grabs() {
        let barrier = CompletionBarrier::counted(1_000);
        assert!(barrier.try_grab_work());
        barrier.cancel();
        barrier.cancel();
        assert!(!barrier.try_grab_work());
        assert_eq!(barrier.completed(), 1.0);
        // Late completions after cancellation must not panic.
        barrier.job_done();
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn timed_closes_at_deadline() {
        let barrier = Arc::new(CompletionBarrier::timed(Duration::from_secs(2)));
        barrier.arm();

        assert!(barrier.try_grab_work());
        barrier.job_done();

        tokio::time::advance(Duration::from_secs(1)).await;
        tokio::task::yield_now().await;
        assert!(barrier.try_grab_work());
        let halfway = barrier.completed();
        assert!(halfway > 0.4 && halfway < 0.6, "halfway: {halfway}");

        tokio::time::advance(Duration::from_secs(1)).await;
        tokio::task::yield_now().await;
        assert!(!barrier.try_grab_work());
        assert_eq!(barrier.completed(), 1.0);
    }

    #[tokio::test]
    async fn timed_cancel_beats_deadline() {
        let barrier = CompletionBarrier::timed(Duration::from_secs(3600));
        barrier.arm();
        assert!(barrier.try_grab_work());
        barrier.cancel();
        assert!(!barrier.try_grab_work());
        assert_eq!(barrier.completed(), 1.0);
    }

    #[test]
    fn cancel_works_without_a_runtime() {
        // The signal handler path: cancel from a plain thread.
        let barrier = Arc::new(CompletionBarrier::counted(10));
        let handle = {
            let barrier = Arc::clone(&barrier);
            std::thread::spawn(move || barrier.cancel())
        };
        handle.join().unwrap();
        assert!(!barrier.try_grab_work());
    }
}
