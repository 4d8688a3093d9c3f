//! Worker pool and run coordinator.
//!
//! The coordinator owns every shared run object, drives N workers plus the
//! two samplers, and assembles the result snapshot after everything joins.
//! Each worker loops grab-pace-request-record until the barrier reports the
//! run done; in-flight requests finish (or hit their own timeout) after
//! cancellation and are recorded normally.

use std::io::Write as _;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::barrier::CompletionBarrier;
use crate::client::{ClientOpts, HttpClient};
use crate::config::{Config, ConfigError, TestKind};
use crate::metrics::RunRecorder;
use crate::output::{
    self, OutputFormatter, SpecHeader, TestReport, TestResults, TestSpec,
};
use crate::ratelimit::{Pace, RateLimiter};

/// Cadence of the progress sampler.
const PROGRESS_REFRESH: Duration = Duration::from_millis(125);
/// Slack added on top of the limiter interval for the RPS sampler.
const RPS_SAMPLE_SLACK: Duration = Duration::from_millis(10);

/// The load generator: construct with a config, `run`, then read the report.
pub struct Cannon {
    core: Arc<Core>,
    formatter: Box<dyn OutputFormatter>,
    time_taken: Duration,
}

struct Core {
    config: Config,
    barrier: CompletionBarrier,
    limiter: RateLimiter,
    client: HttpClient,
    recorder: RunRecorder,
}

/// Cloneable cancellation handle, safe to call from a signal handler.
#[derive(Clone)]
pub struct CancelHandle(CancellationToken);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.cancel();
    }
}

impl Cannon {
    /// Validate the configuration and build every run component. All
    /// configuration errors surface here; `run` itself cannot fail.
    pub fn new(mut config: Config) -> Result<Self, ConfigError> {
        config.validate()?;

        let formatter = output::create_formatter(&config.format, config.print_latencies)?;
        let recorder = RunRecorder::new();
        let opts = ClientOpts::from_config(&config, Arc::clone(&recorder.bytes))?;
        let client = HttpClient::new(config.client_kind, opts);

        let barrier = match config.test_kind() {
            TestKind::Counted(total) => CompletionBarrier::counted(total),
            TestKind::Timed(duration) => CompletionBarrier::timed(duration),
        };
        let limiter = match config.rate {
            Some(rate) => RateLimiter::bucket(rate),
            None => RateLimiter::noop(),
        };

        Ok(Self {
            core: Arc::new(Core {
                config,
                barrier,
                limiter,
                client,
                recorder,
            }),
            formatter,
            time_taken: Duration::ZERO,
        })
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle(self.core.barrier.done_token())
    }

    /// Execute the run. Runtime errors are counted, never returned;
    /// cancellation is not an error.
    pub async fn run(&mut self) {
        let core = Arc::clone(&self.core);
        if core.config.print_intro
            && let Some(line) = self.formatter.intro_line(&core.config)
        {
            println!("{line}");
        }

        core.barrier.arm();
        core.limiter.start(core.barrier.done_token());
        core.recorder.rps.reset();

        tracing::debug!(
            connections = core.config.connections,
            "starting workers"
        );
        let begin = Instant::now();
        let mut workers = JoinSet::new();
        for _ in 0..core.config.connections {
            workers.spawn(worker_loop(Arc::clone(&core)));
        }

        // Both samplers report their exit on this channel so the coordinator
        // returns only after they are finished with the shared state.
        let (exit_tx, mut exit_rx) = mpsc::channel::<()>(2);
        tokio::spawn(rate_meter(Arc::clone(&core), exit_tx.clone()));
        tokio::spawn(progress_meter(Arc::clone(&core), exit_tx));

        while workers.join_next().await.is_some() {}
        self.time_taken = begin.elapsed();

        // Tail sample: requests drained after the last sampler tick.
        core.recorder.sample_rps();

        let _ = exit_rx.recv().await;
        let _ = exit_rx.recv().await;
        tracing::debug!(time_taken = ?self.time_taken, "run finished");
    }

    /// Snapshot of the run for reporting. Meaningful once `run` returned.
    pub fn report(&self) -> TestReport {
        let config = &self.core.config;
        let recorder = &self.core.recorder;

        let (test_type, num_reqs, duration_secs) = match config.test_kind() {
            TestKind::Counted(n) => ("counted", Some(n), None),
            TestKind::Timed(d) => ("timed", None, Some(d.as_secs_f64())),
        };

        let spec = TestSpec {
            url: config.url.clone(),
            method: config.method.to_string(),
            connections: config.connections,
            test_type: test_type.to_owned(),
            num_reqs,
            duration_secs,
            timeout_secs: config.timeout.as_secs_f64(),
            client: config.client_kind.to_string(),
            rate: config.rate,
            stream: config.stream,
            headers: config
                .headers
                .iter()
                .map(|(key, value)| SpecHeader {
                    key: key.clone(),
                    value: value.clone(),
                })
                .collect(),
            body: config.body.clone(),
            body_file: config
                .body_file
                .as_ref()
                .map(|p| p.display().to_string()),
            cert_path: config
                .cert_path
                .as_ref()
                .map(|p| p.display().to_string()),
            key_path: config.key_path.as_ref().map(|p| p.display().to_string()),
        };

        let status = &recorder.status;
        let result = TestResults {
            time_taken_secs: self.time_taken.as_secs_f64(),
            bytes_read: recorder.bytes.read(),
            bytes_written: recorder.bytes.written(),
            req1xx: status.req1xx.load(Ordering::Relaxed),
            req2xx: status.req2xx.load(Ordering::Relaxed),
            req3xx: status.req3xx.load(Ordering::Relaxed),
            req4xx: status.req4xx.load(Ordering::Relaxed),
            req5xx: status.req5xx.load(Ordering::Relaxed),
            others: status.others.load(Ordering::Relaxed),
            latencies: recorder.latency_summary(),
            requests: recorder.rps_summary(),
            errors: recorder.errors.by_frequency(),
        };

        TestReport { spec, result }
    }

    /// Render the report through the configured formatter.
    pub fn print_stats(&self) {
        if !self.core.config.print_result {
            return;
        }
        print!("{}", self.formatter.format_report(&self.report()));
    }

    /// Wall-clock time from worker spawn to join.
    pub fn time_taken(&self) -> Duration {
        self.time_taken
    }
}

async fn worker_loop(core: Arc<Core>) {
    let done = core.barrier.done_token();
    while core.barrier.try_grab_work() {
        if core.limiter.pace(&done).await == Pace::Break {
            break;
        }
        core.perform_single_request().await;
        core.barrier.job_done();
    }
}

impl Core {
    async fn perform_single_request(&self) {
        let outcome = self.client.send().await;
        if let Some(error) = &outcome.error {
            self.recorder.errors.add(&error.to_string());
        }
        self.recorder.record_request(outcome.status, outcome.elapsed);
    }
}

/// Periodically close the RPS window and fold it into the throughput
/// histogram. The cadence tracks the limiter interval plus a small slack so
/// rate-limited runs are not oversampled with zeros.
async fn rate_meter(core: Arc<Core>, exit: mpsc::Sender<()>) {
    let base = core
        .limiter
        .interval()
        .unwrap_or(Duration::from_millis(10));
    let mut ticker = tokio::time::interval(base + RPS_SAMPLE_SLACK);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker.tick().await;

    let done = core.barrier.done_token();
    loop {
        tokio::select! {
            _ = done.cancelled() => break,
            _ = ticker.tick() => core.recorder.sample_rps(),
        }
    }
    let _ = exit.send(()).await;
}

/// Emit the completion fraction on a coarse cadence, with one final full
/// update when the done-signal closes.
async fn progress_meter(core: Arc<Core>, exit: mpsc::Sender<()>) {
    let mut ticker = tokio::time::interval(PROGRESS_REFRESH);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker.tick().await;

    let done = core.barrier.done_token();
    loop {
        tokio::select! {
            _ = done.cancelled() => break,
            _ = ticker.tick() => {
                if core.config.print_progress {
                    print!("\r{:6.2}% done", core.barrier.completed() * 100.0);
                    let _ = std::io::stdout().flush();
                }
            }
        }
    }
    if core.config.print_progress {
        println!("\r{:6.2}% done", 100.0);
        println!("Done!");
    }
    let _ = exit.send(()).await;
}
