//! Command-line interface.
//!
//! Two subcommands: `judge` evaluates a single record file, `run` drives a
//! whole JSONL dataset. All configuration comes from the TOML file named by
//! `--config` plus `UXEVAL_*` environment overrides; the flags here only
//! select what to evaluate and where artifacts land.

use clap::{Parser, Subcommand};
use serde_json::{Value, json};
use std::path::PathBuf;

use crate::client::{AuthMode, CallClient};
use crate::config::EvalConfig;
use crate::dataset::{Record, sanitize_id};
use crate::error::Result;
use crate::pipeline::{Orchestrator, Prompts};
use crate::run::{self, RunOptions};

#[derive(Debug, Parser)]
#[command(name = "uxeval", version, about = "LLM-judged evaluation of machine-generated UI compositions")]
pub struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, global = true, default_value = "uxeval.toml")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Evaluate a single record file through all five stages.
    Judge(JudgeArgs),
    /// Evaluate every record of a JSONL dataset and aggregate the scores.
    Run(RunArgs),
}

#[derive(Debug, clap::Args)]
pub struct JudgeArgs {
    /// Path to the record JSON file.
    #[arg(long)]
    pub record: PathBuf,

    /// Output directory for the record's artifacts.
    #[arg(long)]
    pub out_dir: PathBuf,

    /// Record field holding the UI description (overrides config).
    #[arg(long)]
    pub ui_field: Option<String>,
}

#[derive(Debug, clap::Args)]
pub struct RunArgs {
    /// Path to the JSONL dataset.
    #[arg(long)]
    pub dataset: PathBuf,

    /// Root directory under which the timestamped run directory is created.
    #[arg(long, default_value = "runs")]
    pub run_root: PathBuf,

    /// Process at most this many records.
    #[arg(long)]
    pub limit: Option<usize>,

    /// Case-insensitive substring filter on record ids.
    #[arg(long)]
    pub filter: Option<String>,
}

pub async fn execute(cli: Cli) -> Result<()> {
    let mut config = EvalConfig::load(&cli.config)?;
    match cli.command {
        Command::Judge(args) => {
            if let Some(field) = &args.ui_field {
                config.pipeline.ui_field = field.clone();
            }
            judge(&config, &args).await
        }
        Command::Run(args) => {
            let options = RunOptions {
                dataset: args.dataset,
                run_root: args.run_root,
                limit: args.limit,
                filter: args.filter,
            };
            let report = run::run_dataset(&config, &options).await?;
            println!("{}", serde_json::to_string_pretty(&report).map_err(anyhow::Error::from)?);
            if !report.errors.is_empty() {
                tracing::warn!(errors = report.errors.len(), "run completed with errors");
            }
            Ok(())
        }
    }
}

async fn judge(config: &EvalConfig, args: &JudgeArgs) -> Result<()> {
    let prompts = Prompts::load(&config.pipeline.prompts_dir)?;
    let auth = AuthMode::from_config(&config.auth)?;
    let client = CallClient::new(&config.call, auth);
    let orchestrator = Orchestrator::new(config, client, prompts);

    let record = load_record_file(&args.record)?;
    let outcome = orchestrator.process_record(&record, &args.out_dir).await?;
    println!(
        "{}",
        serde_json::to_string_pretty(&json!({
            "status": "ok",
            "recordId": outcome.record_id,
            "outDir": args.out_dir,
            "overall": outcome.overall,
        }))
        .map_err(anyhow::Error::from)?
    );
    Ok(())
}

/// Read a single-record JSON file. A record without an id or title gets
/// one derived from the file stem.
fn load_record_file(path: &PathBuf) -> Result<Record> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read record {}: {e}", path.display()))?;
    let mut raw: Value = serde_json::from_str(&contents)
        .map_err(|e| anyhow::anyhow!("record {} is not valid JSON: {e}", path.display()))?;
    let has_identity = raw.get("id").is_some() || raw.get("title").is_some();
    if !has_identity
        && let Some(stem) = path.file_stem().and_then(|s| s.to_str())
        && let Value::Object(map) = &mut raw
    {
        map.insert("id".to_string(), json!(sanitize_id(stem)));
    }
    Ok(Record::from_value(raw).map_err(anyhow::Error::from)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn judge_args_parse() {
        let cli = Cli::parse_from([
            "uxeval",
            "--config",
            "custom.toml",
            "judge",
            "--record",
            "r.json",
            "--out-dir",
            "out",
            "--ui-field",
            "scenario",
        ]);
        assert_eq!(cli.config, PathBuf::from("custom.toml"));
        match cli.command {
            Command::Judge(args) => {
                assert_eq!(args.record, PathBuf::from("r.json"));
                assert_eq!(args.ui_field.as_deref(), Some("scenario"));
            }
            _ => panic!("expected judge"),
        }
    }

    #[test]
    fn run_args_default_run_root() {
        let cli = Cli::parse_from(["uxeval", "run", "--dataset", "data.jsonl", "--limit", "5"]);
        match cli.command {
            Command::Run(args) => {
                assert_eq!(args.run_root, PathBuf::from("runs"));
                assert_eq!(args.limit, Some(5));
                assert!(args.filter.is_none());
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn record_file_without_identity_uses_file_stem() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Orders KPI.json");
        std::fs::write(&path, r#"{"ui_description":"a table"}"#).unwrap();
        let record = load_record_file(&path).unwrap();
        assert_eq!(record.id, "orders-kpi");
    }

    #[test]
    fn record_file_with_explicit_id_keeps_it() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("whatever.json");
        std::fs::write(&path, r#"{"id":"r7","prompt":"hello"}"#).unwrap();
        let record = load_record_file(&path).unwrap();
        assert_eq!(record.id, "r7");
    }
}
