//! User-template formatter.
//!
//! The template file is plain text with `{{dotted.path}}` placeholders that
//! resolve against the flattened JSON form of the report, e.g.
//! `{{result.req2xx}}` or `{{spec.url}}`. Unknown placeholders are left
//! untouched.

use std::collections::BTreeMap;
use std::path::Path;

use super::{OutputFormatter, TestReport};
use crate::config::ConfigError;

pub struct TemplateFormatter {
    template: String,
}

impl TemplateFormatter {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let template = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self { template })
    }

    #[cfg(test)]
    fn from_str(template: &str) -> Self {
        Self {
            template: template.to_owned(),
        }
    }
}

impl OutputFormatter for TemplateFormatter {
    fn format_report(&self, report: &TestReport) -> String {
        let values = match serde_json::to_value(report) {
            Ok(value) => flatten(&value),
            Err(e) => {
                tracing::error!("failed to serialize report: {e}");
                BTreeMap::new()
            }
        };
        substitute(&self.template, &values)
    }
}

/// Flatten a JSON value into dotted-path keys. Arrays index numerically.
fn flatten(value: &serde_json::Value) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    walk(value, String::new(), &mut out);
    out
}

fn walk(value: &serde_json::Value, prefix: String, out: &mut BTreeMap<String, String>) {
    match value {
        serde_json::Value::Object(map) => {
            for (key, child) in map {
                let path = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{prefix}.{key}")
                };
                walk(child, path, out);
            }
        }
        serde_json::Value::Array(items) => {
            for (i, child) in items.iter().enumerate() {
                walk(child, format!("{prefix}.{i}"), out);
            }
        }
        serde_json::Value::String(s) => {
            out.insert(prefix, s.clone());
        }
        other => {
            out.insert(prefix, other.to_string());
        }
    }
}

fn substitute(template: &str, values: &BTreeMap<String, String>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find("{{") {
        out.push_str(&rest[..open]);
        let after = &rest[open + 2..];
        match after.find("}}") {
            Some(close) => {
                let key = after[..close].trim();
                match values.get(key) {
                    Some(value) => out.push_str(value),
                    None => {
                        out.push_str("{{");
                        out.push_str(&after[..close]);
                        out.push_str("}}");
                    }
                }
                rest = &after[close + 2..];
            }
            None => {
                out.push_str(&rest[open..]);
                return out;
            }
        }
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::sample_report;

    #[test]
    fn substitutes_dotted_paths() {
        let formatter =
            TemplateFormatter::from_str("{{spec.method}} {{spec.url}}: {{result.req2xx}} ok\n");
        let text = formatter.format_report(&sample_report());
        assert_eq!(text, "GET http://localhost:8080/: 98 ok\n");
    }

    #[test]
    fn indexes_into_arrays() {
        let formatter = TemplateFormatter::from_str(
            "{{result.errors.0.error}} x{{result.errors.0.count}}",
        );
        let text = formatter.format_report(&sample_report());
        assert_eq!(text, "request timeout x2");
    }

    #[test]
    fn leaves_unknown_placeholders_alone() {
        let formatter = TemplateFormatter::from_str("{{no.such.field}} and {{ spec.method }}");
        let text = formatter.format_report(&sample_report());
        assert_eq!(text, "{{no.such.field}} and GET");
    }
}
