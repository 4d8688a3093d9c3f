//! Result snapshot types and output formatting.
//!
//! The run exposes a `TestReport` snapshot (spec echo plus aggregated
//! results); formatters turn it into plain text, JSON, or a user template.

pub mod format;
mod json;
mod plain;
mod template;

pub use json::JsonFormatter;
pub use plain::PlainFormatter;
pub use template::TemplateFormatter;

use std::path::PathBuf;

use serde::Serialize;

use crate::config::{Config, ConfigError};
use crate::metrics::{ErrorCount, HistogramSummary};

/// Output format selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable table (default).
    PlainText,
    /// Pretty-printed JSON.
    Json,
    /// User-provided template file with `{{dotted.path}}` placeholders.
    Template(PathBuf),
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "plain-text" | "pt" => Ok(OutputFormat::PlainText),
            "json" | "j" => Ok(OutputFormat::Json),
            other => match other.strip_prefix("path:") {
                Some(path) if !path.is_empty() => Ok(OutputFormat::Template(PathBuf::from(path))),
                _ => Err(format!(
                    "invalid format '{other}', expected: plain-text (pt), json (j), or path:FILE"
                )),
            },
        }
    }
}

/// Echo of the configuration the run executed with.
#[derive(Debug, Clone, Serialize)]
pub struct TestSpec {
    pub url: String,
    pub method: String,
    pub connections: u64,
    pub test_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_reqs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<f64>,
    pub timeout_secs: f64,
    pub client: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate: Option<u64>,
    pub stream: bool,
    pub headers: Vec<SpecHeader>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub body: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body_file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cert_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_path: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SpecHeader {
    pub key: String,
    pub value: String,
}

/// Aggregated counters and distributions, read-only after the run joins.
#[derive(Debug, Clone, Serialize)]
pub struct TestResults {
    pub time_taken_secs: f64,
    pub bytes_read: i64,
    pub bytes_written: i64,
    pub req1xx: u64,
    pub req2xx: u64,
    pub req3xx: u64,
    pub req4xx: u64,
    pub req5xx: u64,
    pub others: u64,
    /// Latency distribution in microseconds.
    pub latencies: HistogramSummary,
    /// Throughput distribution in requests per second.
    pub requests: HistogramSummary,
    pub errors: Vec<ErrorCount>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TestReport {
    pub spec: TestSpec,
    pub result: TestResults,
}

/// Renders the report (and optionally an intro line) for one output format.
pub trait OutputFormatter: Send + Sync {
    /// One-line run description printed before the run starts. `None` for
    /// machine-readable formats.
    fn intro_line(&self, _config: &Config) -> Option<String> {
        None
    }

    /// Render the final report.
    fn format_report(&self, report: &TestReport) -> String;
}

/// Create a formatter for the selected format. Template files are read
/// eagerly so a bad path fails before any worker starts.
pub fn create_formatter(
    format: &OutputFormat,
    print_latencies: bool,
) -> Result<Box<dyn OutputFormatter>, ConfigError> {
    match format {
        OutputFormat::PlainText => Ok(Box::new(PlainFormatter::new(print_latencies))),
        OutputFormat::Json => Ok(Box::new(JsonFormatter::new())),
        OutputFormat::Template(path) => Ok(Box::new(TemplateFormatter::from_file(path)?)),
    }
}

#[cfg(test)]
pub(crate) fn sample_report() -> TestReport {
    use std::collections::BTreeMap;

    let mut percentiles = BTreeMap::new();
    for (p, v) in [("50", 900.0), ("75", 1100.0), ("90", 1300.0), ("99", 2500.0)] {
        percentiles.insert(p.to_owned(), v);
    }

    TestReport {
        spec: TestSpec {
            url: "http://localhost:8080/".into(),
            method: "GET".into(),
            connections: 10,
            test_type: "counted".into(),
            num_reqs: Some(100),
            duration_secs: None,
            timeout_secs: 2.0,
            client: "fasthttp".into(),
            rate: None,
            stream: false,
            headers: vec![SpecHeader {
                key: "X-Probe".into(),
                value: "1".into(),
            }],
            body: String::new(),
            body_file: None,
            cert_path: None,
            key_path: None,
        },
        result: TestResults {
            time_taken_secs: 0.5,
            bytes_read: 123_456,
            bytes_written: 7_890,
            req1xx: 0,
            req2xx: 98,
            req3xx: 0,
            req4xx: 0,
            req5xx: 0,
            others: 2,
            latencies: HistogramSummary {
                count: 100,
                mean: 1_000.0,
                stdev: 300.0,
                max: 2_500.0,
                percentiles: percentiles.clone(),
            },
            requests: HistogramSummary {
                count: 12,
                mean: 200.0,
                stdev: 25.0,
                max: 260.0,
                percentiles,
            },
            errors: vec![ErrorCount {
                error: "request timeout".into(),
                count: 2,
            }],
        },
    }
}
