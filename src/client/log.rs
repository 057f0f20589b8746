//! Structured call log.
//!
//! Every attempt of every external call appends JSON lines to a durable
//! log: prompt submitted, request sent (secret headers redacted), raw
//! response, parsed result, and error. Logging never interferes with the
//! call itself — append failures are reported via `tracing` and swallowed.

use chrono::{SecondsFormat, Utc};
use serde_json::{Value, json};
use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::PathBuf;

use super::auth::API_KEY_HEADER;

const REDACTED: &str = "***redacted***";

fn is_secret_header(name: &str) -> bool {
    name.eq_ignore_ascii_case("authorization") || name.eq_ignore_ascii_case(API_KEY_HEADER)
}

/// Redact secret header values, preserving names for diagnostics.
pub fn redact_headers<'a, I>(headers: I) -> Value
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let map: serde_json::Map<String, Value> = headers
        .into_iter()
        .map(|(name, value)| {
            let value = if is_secret_header(name) {
                REDACTED
            } else {
                value
            };
            (name.to_string(), Value::String(value.to_string()))
        })
        .collect();
    Value::Object(map)
}

#[derive(Clone)]
pub struct CallLog {
    path: Option<PathBuf>,
}

impl CallLog {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self { path }
    }

    pub fn disabled() -> Self {
        Self { path: None }
    }

    pub fn prompt(&self, corr: &str, body: &Value) {
        self.append(json!({
            "kind": "prompt",
            "timestamp": now_iso(),
            "correlationId": corr,
            "body": body,
        }));
    }

    pub fn request(&self, corr: &str, url: &str, attempt: u32, headers: Value, body: &str) {
        self.append(json!({
            "kind": "request",
            "timestamp": now_iso(),
            "correlationId": corr,
            "url": url,
            "method": "POST",
            "attempt": attempt,
            "headers": headers,
            "body": body,
        }));
    }

    pub fn response(&self, corr: &str, attempt: u32, status: u16, elapsed_ms: u128, body: &str) {
        self.append(json!({
            "kind": "response",
            "timestamp": now_iso(),
            "correlationId": corr,
            "attempt": attempt,
            "status": status,
            "ok": (200..300).contains(&status),
            "elapsedMs": elapsed_ms,
            "body": body,
        }));
    }

    pub fn parsed(&self, corr: &str, parsed: &Value) {
        self.append(json!({
            "kind": "parsed",
            "timestamp": now_iso(),
            "correlationId": corr,
            "parsed": parsed,
        }));
    }

    pub fn error(&self, corr: &str, attempt: u32, message: &str, transient: bool) {
        self.append(json!({
            "kind": "error",
            "timestamp": now_iso(),
            "correlationId": corr,
            "attempt": attempt,
            "error": message,
            "transient": transient,
        }));
    }

    fn append(&self, line: Value) {
        let Some(path) = &self.path else {
            return;
        };
        if let Err(e) = try_append(path, &line) {
            tracing::warn!(path = %path.display(), "call log append failed: {e}");
        }
    }
}

fn try_append(path: &PathBuf, line: &Value) -> std::io::Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{line}")
}

fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secret_headers_are_redacted() {
        let headers = redact_headers([
            ("Content-Type", "application/json"),
            ("api-key", "super-secret"),
            ("Authorization", "Bearer abc"),
        ]);
        assert_eq!(headers["Content-Type"], "application/json");
        assert_eq!(headers["api-key"], REDACTED);
        assert_eq!(headers["Authorization"], REDACTED);
    }

    #[test]
    fn events_append_as_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("calls.log");
        let log = CallLog::new(Some(path.clone()));

        log.prompt("abc", &json!({ "messages": [] }));
        log.response("abc", 1, 200, 12, "{}");
        log.error("abc", 1, "boom", true);

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<Value> = contents
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0]["kind"], "prompt");
        assert_eq!(lines[1]["status"], 200);
        assert_eq!(lines[2]["transient"], true);
        assert!(lines.iter().all(|l| l["correlationId"] == "abc"));
    }

    #[test]
    fn missing_parent_directory_is_created() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/logs/calls.log");
        let log = CallLog::new(Some(path.clone()));
        log.parsed("x", &json!({}));
        assert!(path.exists());
    }

    #[test]
    fn disabled_log_swallows_everything() {
        let log = CallLog::disabled();
        log.prompt("x", &json!({}));
        log.error("x", 1, "ignored", false);
    }

    #[test]
    fn unwritable_path_does_not_panic() {
        let log = CallLog::new(Some(PathBuf::from("/dev/null/not-a-dir/calls.log")));
        log.prompt("x", &json!({}));
    }
}
