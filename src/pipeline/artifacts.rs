//! Per-record artifact store.
//!
//! Every stage writes its effective input and output to the record's
//! directory before the next stage runs, so a failed record leaves a
//! complete trace up to the failing stage. File names are stable and form
//! the on-disk contract consumed by the run summarizer.

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::{Value, json};
use std::fs;
use std::path::{Path, PathBuf};

pub struct ArtifactStore {
    dir: PathBuf,
}

impl ArtifactStore {
    /// Open (and create) the artifact directory for one record.
    pub fn create(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)
            .with_context(|| format!("failed to create artifact dir {}", dir.display()))?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn step_input(&self, step: u8, value: &Value) -> Result<()> {
        self.write_json(&format!("step{step}_input.json"), value)
    }

    pub fn step_output(&self, step: u8, value: &Value) -> Result<()> {
        self.write_json(&format!("step{step}_output.json"), value)
    }

    pub fn write_json<T: Serialize>(&self, name: &str, value: &T) -> Result<()> {
        let path = self.dir.join(name);
        let body = serde_json::to_string_pretty(value)
            .with_context(|| format!("failed to serialize {name}"))?;
        fs::write(&path, body).with_context(|| format!("failed to write {}", path.display()))
    }

    pub fn write_text(&self, name: &str, content: &str) -> Result<()> {
        let path = self.dir.join(name);
        fs::write(&path, content).with_context(|| format!("failed to write {}", path.display()))
    }

    pub fn exists(&self, name: &str) -> bool {
        self.dir.join(name).exists()
    }
}

/// Truncated preview used in step logs, bounded by characters not bytes.
pub fn preview(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

/// Step-1 output payload: id plus a bounded preview of the description.
pub fn step1_summary(record_id: &str, ui_description: &str) -> Value {
    json!({
        "recordId": record_id,
        "uiDescriptionPreview": preview(ui_description, 400),
        "uiDescriptionLength": ui_description.chars().count(),
    })
}
