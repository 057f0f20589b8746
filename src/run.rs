//! Dataset run driver.
//!
//! Iterates records sequentially through the pipeline into
//! `runs/<timestamp>/<recordId>/`, accumulating per-record failures
//! without stopping the run. Config and prompt problems are fatal; a
//! broken record is not. Aggregates dimension means and an overall mean
//! with a CI95 half-width, then writes `run_summary.json` and a rendered
//! `summary.md`.

use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tera::Tera;

use crate::client::{AuthMode, CallClient};
use crate::config::EvalConfig;
use crate::dataset;
use crate::error::Result;
use crate::pipeline::{Orchestrator, Prompts};

const SUMMARY_TEMPLATE: &str = "\
# Run Summary

Records: {{ count }}
{% if overall_mean %}Overall Mean: {{ overall_mean }}{% if overall_ci95 %} \u{b1} {{ overall_ci95 }}{% endif %}
{% endif %}{% for name, value in dimensions %}{{ name }}: {{ value }}
{% endfor %}
## Per Record (first 50)

| id | overall |
|----|---------|
{% for row in records %}| {{ row.recordId }} | {{ row.overallDisplay }} |
{% endfor %}";

const SUMMARY_ROW_LIMIT: usize = 50;

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub dataset: PathBuf,
    pub run_root: PathBuf,
    pub limit: Option<usize>,
    /// Case-insensitive substring filter on record ids.
    pub filter: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordError {
    pub record_id: String,
    pub error: String,
    pub exit_code: u8,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct PerRecord {
    record_id: String,
    overall: Option<f64>,
    overall_display: String,
    dimension_scores: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Aggregate {
    pub count: usize,
    #[serde(flatten)]
    pub dimensions: BTreeMap<String, f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub overall_mean: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub overall_ci95: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    pub run_dir: PathBuf,
    pub timestamp: String,
    pub records_processed: usize,
    pub errors: Vec<RecordError>,
    pub aggregate: Aggregate,
}

/// Process a whole dataset. Returns the report even when individual
/// records failed; only run-fatal errors propagate.
pub async fn run_dataset(config: &EvalConfig, options: &RunOptions) -> Result<RunReport> {
    let prompts = Prompts::load(&config.pipeline.prompts_dir)?;
    let auth = AuthMode::from_config(&config.auth)?;
    let client = CallClient::new(&config.call, auth);
    let orchestrator = Orchestrator::new(config, client, prompts);

    let mut records = dataset::load_jsonl(&options.dataset).await?;
    if let Some(filter) = &options.filter {
        let needle = filter.to_lowercase();
        records.retain(|r| r.id.to_lowercase().contains(&needle));
    }
    if let Some(limit) = options.limit {
        records.truncate(limit);
    }
    tracing::info!(records = records.len(), "starting run");

    let run_dir = options
        .run_root
        .join(Utc::now().format("%Y%m%d_%H%M%S").to_string());
    std::fs::create_dir_all(&run_dir)
        .map_err(|e| anyhow::anyhow!("failed to create run dir {}: {e}", run_dir.display()))?;

    let total = records.len();
    let mut per: Vec<PerRecord> = Vec::new();
    let mut errors: Vec<RecordError> = Vec::new();
    for (index, record) in records.iter().enumerate() {
        tracing::info!(record = %record.id, index = index + 1, total, "processing record");
        let out_dir = run_dir.join(&record.id);
        match orchestrator.process_record(record, &out_dir).await {
            Ok(outcome) => per.push(per_record(&outcome.record_id, &outcome.score)),
            Err(e) if e.is_fatal_for_run() => return Err(e),
            Err(e) => {
                tracing::warn!(record = %record.id, "record failed: {e}");
                errors.push(RecordError {
                    record_id: record.id.clone(),
                    error: e.to_string(),
                    exit_code: e.exit_code(),
                });
            }
        }
    }

    let report = RunReport {
        run_dir: run_dir.clone(),
        timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        records_processed: per.len(),
        errors,
        aggregate: aggregate(&per),
    };
    write_report(&run_dir, &report, &per)?;
    Ok(report)
}

fn per_record(record_id: &str, score: &Value) -> PerRecord {
    let overall = score.get("overall").and_then(Value::as_f64);
    let dimension_scores = score
        .get("dimensionScores")
        .and_then(Value::as_object)
        .map(|dims| {
            dims.iter()
                .filter_map(|(k, v)| v.as_f64().map(|n| (k.clone(), n)))
                .collect()
        })
        .unwrap_or_default();
    PerRecord {
        record_id: record_id.to_string(),
        overall,
        overall_display: overall.map_or_else(|| "?".to_string(), |n| format!("{n:.2}")),
        dimension_scores,
    }
}

/// Dimension means plus the overall mean and its CI95 half-width
/// (`1.96 * pstdev / sqrt(n)`, population form), all rounded to three
/// decimals. Every dimension key observed in any record contributes.
fn aggregate(per: &[PerRecord]) -> Aggregate {
    let mut sums: BTreeMap<String, (f64, usize)> = BTreeMap::new();
    for record in per {
        for (name, value) in &record.dimension_scores {
            let entry = sums.entry(name.clone()).or_insert((0.0, 0));
            entry.0 += value;
            entry.1 += 1;
        }
    }
    let dimensions = sums
        .into_iter()
        .map(|(name, (sum, n))| (name, round3(sum / n as f64)))
        .collect();

    let overall: Vec<f64> = per.iter().filter_map(|r| r.overall).collect();
    let overall_mean = (!overall.is_empty())
        .then(|| round3(overall.iter().sum::<f64>() / overall.len() as f64));
    let overall_ci95 = (overall.len() > 1).then(|| {
        let mean = overall.iter().sum::<f64>() / overall.len() as f64;
        let variance =
            overall.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / overall.len() as f64;
        round3(1.96 * variance.sqrt() / (overall.len() as f64).sqrt())
    });

    Aggregate {
        count: per.len(),
        dimensions,
        overall_mean,
        overall_ci95,
    }
}

fn round3(x: f64) -> f64 {
    (x * 1000.0).round() / 1000.0
}

fn write_report(run_dir: &Path, report: &RunReport, per: &[PerRecord]) -> Result<()> {
    let json = serde_json::to_string_pretty(report)
        .map_err(|e| anyhow::anyhow!("failed to serialize run report: {e}"))?;
    std::fs::write(run_dir.join("run_summary.json"), json)
        .map_err(|e| anyhow::anyhow!("failed to write run_summary.json: {e}"))?;

    let markdown = render_summary(&report.aggregate, per)
        .map_err(|e| anyhow::anyhow!("failed to render summary.md: {e}"))?;
    std::fs::write(run_dir.join("summary.md"), markdown)
        .map_err(|e| anyhow::anyhow!("failed to write summary.md: {e}"))?;
    Ok(())
}

fn render_summary(aggregate: &Aggregate, per: &[PerRecord]) -> tera::Result<String> {
    let mut context = tera::Context::new();
    context.insert("count", &aggregate.count);
    context.insert("overall_mean", &aggregate.overall_mean);
    context.insert("overall_ci95", &aggregate.overall_ci95);
    context.insert("dimensions", &aggregate.dimensions);
    context.insert(
        "records",
        &per.iter().take(SUMMARY_ROW_LIMIT).collect::<Vec<_>>(),
    );
    Tera::one_off(SUMMARY_TEMPLATE, &context, false)
}
