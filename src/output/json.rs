//! JSON formatter for machine parsing.

use super::{OutputFormatter, TestReport};

pub struct JsonFormatter;

impl JsonFormatter {
    pub fn new() -> Self {
        Self
    }
}

impl Default for JsonFormatter {
    fn default() -> Self {
        Self::new()
    }
}

impl OutputFormatter for JsonFormatter {
    fn format_report(&self, report: &TestReport) -> String {
        serde_json::to_string_pretty(report).unwrap_or_else(|e| {
            tracing::error!("failed to serialize report: {e}");
            String::from("{}")
        })
    }
}
