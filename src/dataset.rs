//! Dataset records.
//!
//! A record is one dataset entry: an identifier plus a natural-language UI
//! description (and optionally declarative expected components for the
//! structural matcher). Records are immutable once loaded; ids must be
//! unique within a run.

use anyhow::{Context, Result, bail};
use serde_json::Value;
use std::collections::HashSet;
use std::path::Path;

const MAX_ID_LEN: usize = 80;

/// Ordered fallbacks tried when the configured UI-description field is
/// absent from a record.
pub const UI_FIELD_FALLBACKS: [&str; 4] = ["ui_description", "prompt", "description", "scenario"];

#[derive(Debug, Clone)]
pub struct Record {
    pub id: String,
    pub raw: Value,
}

impl Record {
    /// Build a record from a raw JSON object. The id is the explicit `id`
    /// field when present, otherwise derived from `title`.
    pub fn from_value(raw: Value) -> Result<Self> {
        let id = match raw.get("id").and_then(Value::as_str) {
            Some(id) if !id.trim().is_empty() => id.trim().to_string(),
            _ => {
                let title = raw
                    .get("title")
                    .and_then(Value::as_str)
                    .context("record has neither an id nor a title")?;
                sanitize_id(title)
            }
        };
        if id.is_empty() {
            bail!("record id sanitized to an empty string");
        }
        Ok(Self { id, raw })
    }

    /// Extract the UI description, trying `primary` first and then the
    /// standard fallbacks.
    pub fn ui_description(&self, primary: &str) -> Option<String> {
        std::iter::once(primary)
            .chain(UI_FIELD_FALLBACKS)
            .find_map(|key| self.raw.get(key))
            .map(value_to_text)
    }
}

/// Derive a deterministic record id from a human-readable title:
/// case-folded, runs of non-word characters collapsed to a single `-`,
/// trimmed, truncated.
pub fn sanitize_id(title: &str) -> String {
    let mut out = String::with_capacity(title.len());
    let mut pending_sep = false;
    for c in title.trim().to_lowercase().chars() {
        if c.is_alphanumeric() || c == '_' {
            if pending_sep && !out.is_empty() {
                out.push('-');
            }
            pending_sep = false;
            out.push(c);
        } else {
            pending_sep = true;
        }
    }
    out.truncate(MAX_ID_LEN);
    out
}

fn value_to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Load a JSONL dataset, one record object per non-empty line. Fails on the
/// first duplicate id.
pub async fn load_jsonl(path: &Path) -> Result<Vec<Record>> {
    let contents = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read dataset {}", path.display()))?;
    let mut records = Vec::new();
    let mut seen = HashSet::new();
    for (lineno, line) in contents.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let raw: Value = serde_json::from_str(line)
            .with_context(|| format!("dataset line {} is not valid JSON", lineno + 1))?;
        let record = Record::from_value(raw)
            .with_context(|| format!("dataset line {}", lineno + 1))?;
        if !seen.insert(record.id.clone()) {
            bail!("duplicate record id: {}", record.id);
        }
        records.push(record);
    }
    Ok(records)
}
