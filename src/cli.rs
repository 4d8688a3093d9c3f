//! Command-line surface: flag parsing and conversion into a `Config`.
//!
//! Parsing stays thin here; everything that can be semantically wrong goes
//! through `Config::validate` so direct library users get the same checks.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::config::{ClientKind, Config, ConfigError};
use crate::output::OutputFormat;

#[derive(Debug, Parser)]
#[command(name = "httpcannon")]
#[command(about = "Fast cross-platform HTTP(S) load generator")]
#[command(version)]
pub struct Cli {
    /// Target URL; the scheme defaults to http when omitted
    #[arg(value_name = "URL", required = true)]
    pub url: String,

    /// Number of concurrent connections
    #[arg(short = 'c', long = "connections", value_name = "N", default_value_t = 125)]
    pub connections: u64,

    /// Total number of requests (counted mode)
    #[arg(short = 'n', long = "requests", value_name = "N")]
    pub requests: Option<u64>,

    /// Test duration (timed mode), e.g. 10s, 2m
    #[arg(short = 'd', long = "duration", value_name = "DURATION", value_parser = parse_duration)]
    pub duration: Option<Duration>,

    /// Per-request timeout
    #[arg(short = 't', long = "timeout", value_name = "DURATION", default_value = "2s", value_parser = parse_duration)]
    pub timeout: Duration,

    /// Target requests per second; enables token-bucket pacing
    #[arg(short = 'r', long = "rate", value_name = "RPS")]
    pub rate: Option<u64>,

    /// HTTP method
    #[arg(short = 'm', long = "method", value_name = "METHOD", default_value = "GET")]
    pub method: String,

    /// Inline request body
    #[arg(short = 'b', long = "body", value_name = "STRING")]
    pub body: Option<String>,

    /// Request body read from a file
    #[arg(short = 'f', long = "body-file", value_name = "PATH")]
    pub body_file: Option<PathBuf>,

    /// Send the body with chunked transfer encoding
    #[arg(short = 's', long = "stream")]
    pub stream: bool,

    /// Extra header as "Key: Value"; repeatable, order and duplicates kept
    #[arg(short = 'H', long = "header", value_name = "HEADER")]
    pub headers: Vec<String>,

    /// Skip TLS certificate verification
    #[arg(short = 'k', long = "insecure")]
    pub insecure: bool,

    /// Client certificate file (PEM)
    #[arg(long = "cert", value_name = "PATH")]
    pub cert: Option<PathBuf>,

    /// Client key file (PEM)
    #[arg(long = "key", value_name = "PATH")]
    pub key: Option<PathBuf>,

    /// Use the fast-path HTTP/1.1 client (default)
    #[arg(long = "fasthttp", group = "client")]
    pub fasthttp: bool,

    /// Use the standard HTTP/1.1 client
    #[arg(long = "http1", group = "client")]
    pub http1: bool,

    /// Use the HTTP/2 client
    #[arg(long = "http2", group = "client")]
    pub http2: bool,

    /// Include the latency percentile table in the output
    #[arg(short = 'l', long = "latencies")]
    pub latencies: bool,

    /// What to print: comma-separated subset of intro (i), progress (p),
    /// result (r)
    #[arg(short = 'p', long = "print", value_name = "SPEC")]
    pub print: Option<String>,

    /// Suppress all output
    #[arg(short = 'q', long = "no-print")]
    pub no_print: bool,

    /// Output format: plain-text (pt), json (j), or path:FILE
    #[arg(short = 'o', long = "format", value_name = "FORMAT", default_value = "plain-text")]
    pub format: String,
}

impl Cli {
    pub fn into_config(self) -> Result<Config, ConfigError> {
        let headers = self
            .headers
            .iter()
            .map(|raw| parse_header(raw))
            .collect::<Result<Vec<_>, _>>()?;

        let (print_intro, print_progress, print_result) = if self.no_print {
            (false, false, false)
        } else {
            match &self.print {
                None => (true, true, true),
                Some(spec) => parse_print_spec(spec)?,
            }
        };

        let method = self
            .method
            .parse::<http::Method>()
            .map_err(|_| ConfigError::UnknownMethod(self.method.clone()))?;

        let client_kind = if self.http2 {
            ClientKind::Http2
        } else if self.http1 {
            ClientKind::Http1
        } else {
            ClientKind::Fast
        };

        let format = self
            .format
            .parse::<OutputFormat>()
            .map_err(|_| ConfigError::UnknownFormat(self.format.clone()))?;

        Ok(Config {
            url: self.url,
            method,
            headers,
            body: self.body.unwrap_or_default(),
            body_file: self.body_file,
            stream: self.stream,
            connections: self.connections,
            num_reqs: self.requests,
            duration: self.duration,
            timeout: self.timeout,
            rate: self.rate,
            client_kind,
            cert_path: self.cert,
            key_path: self.key,
            insecure: self.insecure,
            print_intro,
            print_progress,
            print_result,
            print_latencies: self.latencies,
            format,
        })
    }
}

fn parse_header(raw: &str) -> Result<(String, String), ConfigError> {
    let (key, value) = raw
        .split_once(':')
        .ok_or_else(|| ConfigError::InvalidHeader(raw.to_owned()))?;
    if key.is_empty() {
        return Err(ConfigError::InvalidHeader(raw.to_owned()));
    }
    Ok((key.to_owned(), value.trim().to_owned()))
}

fn parse_print_spec(spec: &str) -> Result<(bool, bool, bool), ConfigError> {
    let mut intro = false;
    let mut progress = false;
    let mut result = false;
    for token in spec.split(',') {
        match token.trim() {
            "i" | "intro" => intro = true,
            "p" | "progress" => progress = true,
            "r" | "result" => result = true,
            _ => return Err(ConfigError::InvalidPrintSpec(spec.to_owned())),
        }
    }
    Ok((intro, progress, result))
}

/// Parse durations of the form `250ms`, `10s`, `2m`, `1h`; a bare number
/// means seconds.
fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty duration".to_string());
    }

    let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    let (digits, suffix) = s.split_at(split);
    let value: u64 = digits
        .parse()
        .map_err(|e| format!("invalid number: {e}"))?;

    match suffix.trim() {
        "ns" => Ok(Duration::from_nanos(value)),
        "us" => Ok(Duration::from_micros(value)),
        "ms" => Ok(Duration::from_millis(value)),
        "" | "s" | "sec" | "secs" => Ok(Duration::from_secs(value)),
        "m" | "min" | "mins" => Ok(Duration::from_secs(value * 60)),
        "h" | "hr" | "hrs" | "hour" | "hours" => Ok(Duration::from_secs(value * 3600)),
        other => Err(format!("unknown time unit: {other}")),
    }
}
