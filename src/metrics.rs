//! Run statistics: counters, histograms, and the canonical error map.
//!
//! Everything here is owned per run so several runs can execute inside one
//! process. Counters are plain atomics; the latency and throughput
//! distributions are concurrent fixed-layout histograms that workers update
//! without coordination and readers snapshot only after the run joins.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use metriken::AtomicHistogram;
use metriken::histogram::Histogram;
use serde::Serialize;

/// Histogram layout shared by the latency and throughput distributions.
const GROUPING_POWER: u8 = 7;
const MAX_VALUE_POWER: u8 = 64;

/// Percentiles reported in every histogram summary.
const REPORTED_PERCENTILES: [f64; 4] = [50.0, 75.0, 90.0, 99.0];

/// Bytes moved over the wire, credited by the counting connection wrapper.
#[derive(Debug, Default)]
pub struct ByteCounters {
    read: AtomicI64,
    written: AtomicI64,
}

impl ByteCounters {
    pub fn add_read(&self, n: i64) {
        self.read.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_written(&self, n: i64) {
        self.written.fetch_add(n, Ordering::Relaxed);
    }

    pub fn read(&self) -> i64 {
        self.read.load(Ordering::Relaxed)
    }

    pub fn written(&self) -> i64 {
        self.written.load(Ordering::Relaxed)
    }
}

/// Response counters bucketed by status class.
///
/// The zero status of an errored request lands in `others`, alongside any
/// code outside the 1xx-5xx range.
#[derive(Debug, Default)]
pub struct StatusCounters {
    pub req1xx: AtomicU64,
    pub req2xx: AtomicU64,
    pub req3xx: AtomicU64,
    pub req4xx: AtomicU64,
    pub req5xx: AtomicU64,
    pub others: AtomicU64,
}

impl StatusCounters {
    pub fn record(&self, code: u16) {
        let counter = match code / 100 {
            1 => &self.req1xx,
            2 => &self.req2xx,
            3 => &self.req3xx,
            4 => &self.req4xx,
            5 => &self.req5xx,
            _ => &self.others,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Two-field bookkeeping behind the throughput sampler.
///
/// The mutex is held only for the arithmetic, never across I/O.
#[derive(Debug)]
pub struct RpsMeter {
    window: Mutex<Window>,
}

#[derive(Debug)]
struct Window {
    reqs: i64,
    since: Instant,
}

impl RpsMeter {
    pub fn new() -> Self {
        Self {
            window: Mutex::new(Window {
                reqs: 0,
                since: Instant::now(),
            }),
        }
    }

    /// Count one finished request towards the current window.
    pub fn mark(&self) {
        let mut w = self.window.lock().unwrap();
        w.reqs += 1;
    }

    /// Close the current window and return its rate in requests per second.
    pub fn take_rate(&self) -> f64 {
        let (reqs, elapsed) = {
            let mut w = self.window.lock().unwrap();
            let reqs = w.reqs;
            let elapsed = w.since.elapsed();
            w.reqs = 0;
            w.since = Instant::now();
            (reqs, elapsed)
        };
        let secs = elapsed.as_secs_f64();
        if secs > 0.0 { reqs as f64 / secs } else { 0.0 }
    }

    /// Restart the window, discarding anything accumulated so far.
    pub fn reset(&self) {
        let mut w = self.window.lock().unwrap();
        w.reqs = 0;
        w.since = Instant::now();
    }
}

impl Default for RpsMeter {
    fn default() -> Self {
        Self::new()
    }
}

/// A canonical error message and how often it occurred.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorCount {
    pub error: String,
    pub count: u64,
}

/// Frequency map over canonical transport error strings.
#[derive(Debug, Default)]
pub struct ErrorMap {
    entries: Mutex<HashMap<String, u64>>,
}

impl ErrorMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, message: &str) {
        let mut entries = self.entries.lock().unwrap();
        *entries.entry(message.to_owned()).or_insert(0) += 1;
    }

    pub fn sum(&self) -> u64 {
        self.entries.lock().unwrap().values().sum()
    }

    /// Entries sorted by count descending, ties broken by message ascending.
    pub fn by_frequency(&self) -> Vec<ErrorCount> {
        let entries = self.entries.lock().unwrap();
        let mut out: Vec<ErrorCount> = entries
            .iter()
            .map(|(error, count)| ErrorCount {
                error: error.clone(),
                count: *count,
            })
            .collect();
        out.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.error.cmp(&b.error)));
        out
    }
}

/// Summary statistics extracted from a histogram snapshot after the run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct HistogramSummary {
    pub count: u64,
    pub mean: f64,
    pub stdev: f64,
    pub max: f64,
    pub percentiles: BTreeMap<String, f64>,
}

/// All shared per-run statistics, created by the coordinator and mutated by
/// workers and samplers while the run is live.
pub struct RunRecorder {
    pub bytes: std::sync::Arc<ByteCounters>,
    pub status: StatusCounters,
    pub latencies: AtomicHistogram,
    pub requests: AtomicHistogram,
    pub errors: ErrorMap,
    pub rps: RpsMeter,
}

impl RunRecorder {
    pub fn new() -> Self {
        Self {
            bytes: std::sync::Arc::new(ByteCounters::default()),
            status: StatusCounters::default(),
            latencies: AtomicHistogram::new(GROUPING_POWER, MAX_VALUE_POWER),
            requests: AtomicHistogram::new(GROUPING_POWER, MAX_VALUE_POWER),
            errors: ErrorMap::new(),
            rps: RpsMeter::new(),
        }
    }

    /// Record one finished request attempt.
    ///
    /// Latency is recorded even when the request failed, so the distribution
    /// reflects attempted work; the zero status of a failed request is routed
    /// to `others` by the status counters.
    pub fn record_request(&self, status: u16, elapsed: Duration) {
        let _ = self.latencies.increment(elapsed.as_micros() as u64);
        self.rps.mark();
        self.status.record(status);
    }

    /// Close the current throughput window and fold it into the RPS
    /// distribution. Keys are req/s rounded to the nearest integer.
    pub fn sample_rps(&self) {
        let rate = self.rps.take_rate();
        if rate.is_finite() && rate >= 0.0 {
            let _ = self.requests.increment(rate.round() as u64);
        }
    }

    pub fn latency_summary(&self) -> HistogramSummary {
        summarize(&self.latencies)
    }

    pub fn rps_summary(&self) -> HistogramSummary {
        summarize(&self.requests)
    }
}

impl Default for RunRecorder {
    fn default() -> Self {
        Self::new()
    }
}

/// Compute summary statistics from a histogram snapshot.
///
/// Mean and standard deviation are approximated from bucket midpoints, the
/// percentiles from the upper edge of the matching bucket.
fn summarize(hist: &AtomicHistogram) -> HistogramSummary {
    let Some(snapshot) = hist.load() else {
        return HistogramSummary::default();
    };

    let (count, mean, stdev) = moments(&snapshot);

    let mut percentiles = BTreeMap::new();
    if let Ok(Some(results)) = snapshot.percentiles(&REPORTED_PERCENTILES) {
        for (pct, bucket) in results {
            percentiles.insert(format!("{pct}"), bucket.end() as f64);
        }
    }

    let max = match snapshot.percentiles(&[100.0]) {
        Ok(Some(results)) => results
            .first()
            .map(|(_, bucket)| bucket.end() as f64)
            .unwrap_or(0.0),
        _ => 0.0,
    };

    HistogramSummary {
        count,
        mean,
        stdev,
        max,
        percentiles,
    }
}

fn moments(snapshot: &Histogram) -> (u64, f64, f64) {
    let mut count = 0u64;
    let mut sum = 0.0f64;
    for bucket in snapshot.into_iter() {
        let n = bucket.count();
        if n == 0 {
            continue;
        }
        count += n;
        let midpoint = (bucket.start() + bucket.end()) as f64 / 2.0;
        sum += n as f64 * midpoint;
    }
    if count == 0 {
        return (0, 0.0, 0.0);
    }
    let mean = sum / count as f64;

    let mut variance = 0.0f64;
    for bucket in snapshot.into_iter() {
        let n = bucket.count();
        if n == 0 {
            continue;
        }
        let midpoint = (bucket.start() + bucket.end()) as f64 / 2.0;
        let delta = midpoint - mean;
        variance += n as f64 * delta * delta;
    }
    (count, mean, (variance / count as f64).sqrt())
}
