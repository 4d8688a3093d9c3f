pub mod barrier;
pub mod cli;
pub mod client;
pub mod config;
pub mod metrics;
pub mod output;
pub mod ratelimit;
pub mod worker;

pub use barrier::CompletionBarrier;
pub use cli::Cli;
pub use config::{ClientKind, Config, ConfigError, TestKind};
pub use metrics::{ErrorCount, HistogramSummary};
pub use output::{OutputFormat, TestReport, TestResults, TestSpec};
pub use ratelimit::{Pace, RateLimiter};
pub use worker::{CancelHandle, Cannon};
