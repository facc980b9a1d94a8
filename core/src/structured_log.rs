//! Append-only structured event log. Each record is one YAML document in a
//! per-session file, separated by `---`, with an ISO-8601 `timestamp` as the
//! first key. Multi-line strings use the block-scalar style so request and
//! response bodies stay readable with a pager.

use std::fmt::Write as _;
use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;

use serde_json::Value;
use tracing::warn;

#[derive(Debug)]
struct LoggerState {
    initialized: bool,
    counter: u64,
}

/// Records structured data to `<session_dir>/<name>.yaml`. Writes are
/// serialised by a logger-wide lock; readers are external.
#[derive(Debug, Clone)]
pub struct StructuredLogger {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    path: PathBuf,
    state: Mutex<LoggerState>,
}

impl StructuredLogger {
    pub fn new(session_dir: PathBuf, name: &str) -> Self {
        Self {
            inner: Arc::new(Inner {
                path: session_dir.join(format!("{name}.yaml")),
                state: Mutex::new(LoggerState {
                    initialized: false,
                    counter: 0,
                }),
            }),
        }
    }

    pub fn path(&self) -> &PathBuf {
        &self.inner.path
    }

    /// Append `data` as a new YAML document with a `timestamp` first key.
    /// Logging failures are reported through tracing and never propagate.
    pub fn record(&self, data: &Value) {
        let mut state = match self.inner.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        if let Err(e) = self.append_document(&mut state, data) {
            warn!("structured logger: failed to record entry: {e}");
        }
    }

    fn append_document(
        &self,
        state: &mut LoggerState,
        data: &Value,
    ) -> std::io::Result<()> {
        if !state.initialized {
            if let Some(parent) = self.inner.path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            if !self.inner.path.exists() {
                std::fs::write(&self.inner.path, "# neo structured logs\n")?;
            }
            state.initialized = true;
        }

        let mut doc = String::new();
        if state.counter > 0 {
            doc.push_str("\n---\n");
        } else {
            doc.push('\n');
        }
        let timestamp = chrono::Local::now().to_rfc3339();
        writeln!(doc, "timestamp: {timestamp}").ok();
        if let Value::Object(map) = data {
            for (key, value) in map {
                write_entry(&mut doc, key, value, 0);
            }
        } else {
            write_value_line(&mut doc, data, 0);
        }

        let mut file = OpenOptions::new().append(true).open(&self.inner.path)?;
        file.write_all(doc.as_bytes())?;
        state.counter += 1;
        Ok(())
    }
}

fn indent_str(indent: usize) -> String {
    " ".repeat(indent)
}

fn write_entry(out: &mut String, key: &str, value: &Value, indent: usize) {
    let pad = indent_str(indent);
    let key = format_key(key);
    match value {
        Value::Object(map) => {
            writeln!(out, "{pad}{key}:").ok();
            for (k, v) in map {
                write_entry(out, k, v, indent + 2);
            }
        }
        Value::Array(items) => {
            writeln!(out, "{pad}{key}:").ok();
            for item in items {
                write_list_item(out, item, indent + 2);
            }
        }
        Value::String(s) if s.contains('\n') => {
            writeln!(out, "{pad}{key}: |").ok();
            let content_pad = indent_str(indent + 2);
            for line in s.split('\n') {
                writeln!(out, "{content_pad}{line}").ok();
            }
        }
        other => {
            writeln!(out, "{pad}{key}: {}", format_scalar(other)).ok();
        }
    }
}

fn write_list_item(out: &mut String, value: &Value, indent: usize) {
    let pad = indent_str(indent);
    match value {
        Value::Object(map) => {
            writeln!(out, "{pad}-").ok();
            for (k, v) in map {
                write_entry(out, k, v, indent + 2);
            }
        }
        Value::Array(items) => {
            writeln!(out, "{pad}-").ok();
            for item in items {
                write_list_item(out, item, indent + 2);
            }
        }
        Value::String(s) if s.contains('\n') => {
            writeln!(out, "{pad}- |").ok();
            let content_pad = indent_str(indent + 2);
            for line in s.split('\n') {
                writeln!(out, "{content_pad}{line}").ok();
            }
        }
        other => {
            writeln!(out, "{pad}- {}", format_scalar(other)).ok();
        }
    }
}

fn write_value_line(out: &mut String, value: &Value, indent: usize) {
    writeln!(out, "{}{}", indent_str(indent), format_scalar(value)).ok();
}

const YAML_METACHARS: &[char] = &[':', '{', '[', ']', '}', '!', '@', '#', '%', '^', '&', '*'];

fn needs_quoting(s: &str) -> bool {
    s.contains(YAML_METACHARS)
}

fn format_key(key: &str) -> String {
    if needs_quoting(key) {
        format!("'{}'", key.replace('\'', "''"))
    } else {
        key.to_string()
    }
}

fn format_scalar(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) if needs_quoting(s) => format!("'{}'", s.replace('\'', "''")),
        Value::String(s) => s.clone(),
        // Nested values are handled by the entry writers.
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use serde_json::json;

    use super::*;

    #[test]
    fn records_are_separated_yaml_documents() {
        let dir = tempfile::tempdir().unwrap();
        let logger = StructuredLogger::new(dir.path().to_path_buf(), "requests");

        logger.record(&json!({"message": "first", "count": 1}));
        logger.record(&json!({"message": "second", "ok": true}));

        let content = std::fs::read_to_string(logger.path()).unwrap();
        assert!(content.starts_with("# neo structured logs\n"));
        assert_eq!(content.matches("\n---\n").count(), 1);
        assert!(content.contains("message: first"));
        assert!(content.contains("count: 1"));
        assert!(content.contains("ok: true"));
        // Every document leads with its timestamp.
        assert_eq!(content.matches("timestamp: ").count(), 2);
    }

    #[test]
    fn multiline_strings_use_block_scalars() {
        let dir = tempfile::tempdir().unwrap();
        let logger = StructuredLogger::new(dir.path().to_path_buf(), "requests");

        logger.record(&json!({"body": "line one\nline two"}));

        let content = std::fs::read_to_string(logger.path()).unwrap();
        assert!(content.contains("body: |\n  line one\n  line two"));
    }

    #[test]
    fn metacharacter_scalars_are_quoted() {
        let dir = tempfile::tempdir().unwrap();
        let logger = StructuredLogger::new(dir.path().to_path_buf(), "requests");

        logger.record(&json!({"model": "anthropic/claude-3.7-sonnet:thinking"}));

        let content = std::fs::read_to_string(logger.path()).unwrap();
        assert!(content.contains("model: 'anthropic/claude-3.7-sonnet:thinking'"));
    }

    #[test]
    fn nested_maps_and_lists_are_indented() {
        let dir = tempfile::tempdir().unwrap();
        let logger = StructuredLogger::new(dir.path().to_path_buf(), "requests");

        logger.record(&json!({
            "meta": {"session_id": "s1", "message_count": 3},
            "stops": ["a", "b"],
        }));

        let content = std::fs::read_to_string(logger.path()).unwrap();
        assert!(content.contains("meta:\n"));
        assert!(content.contains("  session_id: s1"));
        assert!(content.contains("stops:\n  - a\n  - b"));
    }
}
