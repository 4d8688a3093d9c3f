//! Human-readable table formatter.

use std::fmt::Write;

use super::format::{format_bytes, format_latency_us, format_rate};
use super::{OutputFormatter, TestReport};
use crate::config::{Config, TestKind};

pub struct PlainFormatter {
    print_latencies: bool,
}

impl PlainFormatter {
    pub fn new(print_latencies: bool) -> Self {
        Self { print_latencies }
    }
}

impl OutputFormatter for PlainFormatter {
    fn intro_line(&self, config: &Config) -> Option<String> {
        let line = match config.test_kind() {
            TestKind::Counted(n) => format!(
                "Firing at {} with {} request(s) over {} connection(s)",
                config.url, n, config.connections
            ),
            TestKind::Timed(d) => format!(
                "Firing at {} for {:?} over {} connection(s)",
                config.url, d, config.connections
            ),
        };
        Some(line)
    }

    fn format_report(&self, report: &TestReport) -> String {
        let r = &report.result;
        let mut out = String::new();

        let _ = writeln!(
            out,
            "{:<12}{:>12}{:>12}{:>12}",
            "Statistics", "Avg", "Stdev", "Max"
        );
        let _ = writeln!(
            out,
            "  {:<10}{:>12}{:>12}{:>12}",
            "Reqs/sec",
            format_rate(r.requests.mean),
            format_rate(r.requests.stdev),
            format_rate(r.requests.max),
        );
        let _ = writeln!(
            out,
            "  {:<10}{:>12}{:>12}{:>12}",
            "Latency",
            format_latency_us(r.latencies.mean),
            format_latency_us(r.latencies.stdev),
            format_latency_us(r.latencies.max),
        );

        if self.print_latencies {
            let _ = writeln!(out, "  Latency distribution:");
            for (pct, value) in &r.latencies.percentiles {
                let _ = writeln!(out, "    {:>4}% {:>10}", pct, format_latency_us(*value));
            }
        }

        let _ = writeln!(out, "  HTTP codes:");
        let _ = writeln!(
            out,
            "    1xx - {}, 2xx - {}, 3xx - {}, 4xx - {}, 5xx - {}",
            r.req1xx, r.req2xx, r.req3xx, r.req4xx, r.req5xx
        );
        let _ = writeln!(out, "    others - {}", r.others);

        if !r.errors.is_empty() {
            let _ = writeln!(out, "  Errors:");
            for e in &r.errors {
                let _ = writeln!(out, "    {:>10} - {}", e.error, e.count);
            }
        }

        let total = (r.bytes_read + r.bytes_written).max(0) as f64;
        let per_sec = if r.time_taken_secs > 0.0 {
            total / r.time_taken_secs
        } else {
            0.0
        };
        let _ = writeln!(out, "  Throughput: {}/s", format_bytes(per_sec));

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::sample_report;

    #[test]
    fn report_contains_the_status_table() {
        let formatter = PlainFormatter::new(false);
        let text = formatter.format_report(&sample_report());
        assert!(text.contains("Reqs/sec"));
        assert!(text.contains("1xx - 0, 2xx - 98, 3xx - 0, 4xx - 0, 5xx - 0"));
        assert!(text.contains("others - 2"));
        assert!(text.contains("request timeout - 2"));
        assert!(text.contains("Throughput:"));
        assert!(!text.contains("Latency distribution"));
    }

    #[test]
    fn latency_table_is_opt_in() {
        let formatter = PlainFormatter::new(true);
        let text = formatter.format_report(&sample_report());
        assert!(text.contains("Latency distribution:"));
        assert!(text.contains("50%"));
        assert!(text.contains("99%"));
    }

    #[test]
    fn intro_describes_the_run() {
        let formatter = PlainFormatter::new(false);
        let mut config = Config {
            url: "http://localhost:9999/".into(),
            num_reqs: Some(42),
            connections: 7,
            ..Config::default()
        };
        config.validate().unwrap();
        let line = formatter.intro_line(&config).unwrap();
        assert!(line.contains("42 request(s)"));
        assert!(line.contains("7 connection(s)"));
    }
}
