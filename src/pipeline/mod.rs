//! Five-stage evaluation pipeline for one record.
//!
//! Load, render, interpret-intended, interpret-rendered, judge. Stages run
//! strictly in order and fail fast; every stage's effective input and
//! output is persisted before the next stage runs. The orchestrator does
//! no retries of its own, the call client owns those; it only maps
//! failures onto stage-tagged errors.

pub mod artifacts;
pub mod template;

use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use serde_json::{Map, Value, json};
use std::fmt;
use std::path::Path;

use crate::client::{CallClient, CallError, ChatMessage};
use crate::config::{EmptyTreePolicy, EvalConfig};
use crate::dataset::Record;
use crate::error::EvalError;
use crate::matcher::{self, ComponentNode, ExpectedComponent};
use crate::normalize;
use artifacts::ArtifactStore;

const PROMPT_INTENDED: &str = "interpret_intended.prompt.txt";
const PROMPT_RENDERED: &str = "interpret_rendered.prompt.txt";
const PROMPT_JUDGE: &str = "judge_scoring.prompt.txt";

const SYSTEM_INTENDED: &str = "You extract intended UI structure. Output strict JSON only.";
const SYSTEM_RENDERED: &str = "You summarize rendered UI structure. Output strict JSON only.";
const SYSTEM_JUDGE: &str = "You are an impartial evaluator returning scores JSON only.";

/// Pipeline stage tag carried by stage-scoped errors and artifacts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Load,
    Render,
    InterpretIntended,
    InterpretRendered,
    Judge,
}

impl Stage {
    pub fn step(self) -> u8 {
        match self {
            Self::Load => 1,
            Self::Render => 2,
            Self::InterpretIntended => 3,
            Self::InterpretRendered => 4,
            Self::Judge => 5,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Load => "load",
            Self::Render => "render",
            Self::InterpretIntended => "interpret_intended",
            Self::InterpretRendered => "interpret_rendered",
            Self::Judge => "judge",
        };
        f.write_str(name)
    }
}

/// The three prompt templates, loaded once per run.
#[derive(Debug, Clone)]
pub struct Prompts {
    pub intended: String,
    pub rendered: String,
    pub judge: String,
}

impl Prompts {
    pub fn load(dir: &Path) -> Result<Self, EvalError> {
        Ok(Self {
            intended: read_prompt(dir, PROMPT_INTENDED)?,
            rendered: read_prompt(dir, PROMPT_RENDERED)?,
            judge: read_prompt(dir, PROMPT_JUDGE)?,
        })
    }
}

fn read_prompt(dir: &Path, name: &str) -> Result<String, EvalError> {
    let path = dir.join(name);
    std::fs::read_to_string(&path).map_err(|_| EvalError::PromptMissing(path))
}

/// Result of one fully processed record.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordOutcome {
    pub record_id: String,
    pub overall: Option<f64>,
    #[serde(skip)]
    pub score: Value,
}

pub struct Orchestrator {
    client: CallClient,
    prompts: Prompts,
    tool_name: String,
    tool_health_url: String,
    tool_call_url: String,
    model_url: String,
    model_label: String,
    ui_field: String,
    empty_tree: EmptyTreePolicy,
}

impl Orchestrator {
    pub fn new(config: &EvalConfig, client: CallClient, prompts: Prompts) -> Self {
        Self {
            client,
            prompts,
            tool_name: config.tool.name.clone(),
            tool_health_url: config.tool_health_url(),
            tool_call_url: config.tool_call_url(),
            model_url: config.model_url(),
            model_label: config.model.deployment.clone(),
            ui_field: config.pipeline.ui_field.clone(),
            empty_tree: config.pipeline.empty_tree,
        }
    }

    /// Run all five stages for one record, writing artifacts into `out_dir`.
    pub async fn process_record(
        &self,
        record: &Record,
        out_dir: &Path,
    ) -> Result<RecordOutcome, EvalError> {
        let store = ArtifactStore::create(out_dir)?;
        let mut warnings: Vec<String> = Vec::new();

        // Stage 1: extract the UI description.
        let ui_description = self.load_stage(record, &store)?;

        // Stage 2: render through the tool and normalize.
        let tree = self
            .render_stage(&ui_description, &store, &mut warnings)
            .await?;
        let agent_output = serde_json::to_string_pretty(&tree)
            .map_err(|e| EvalError::ToolResponse {
                message: e.to_string(),
            })?;
        store.write_text("agent_output.txt", &agent_output)?;

        // Stage 3: interpret the intended UI.
        let intended = self
            .interpret_stage(
                Stage::InterpretIntended,
                &self.prompts.intended,
                &[("UI_DESCRIPTION", ui_description.as_str())],
                SYSTEM_INTENDED,
                "prompt_step3_intended.txt",
                "intended_interpretation.json",
                &store,
            )
            .await?;

        // Stage 4: interpret the rendered UI.
        let rendered = self
            .interpret_stage(
                Stage::InterpretRendered,
                &self.prompts.rendered,
                &[("AGENT_OUTPUT", agent_output.as_str())],
                SYSTEM_RENDERED,
                "prompt_step4_rendered.txt",
                "rendered_interpretation.json",
                &store,
            )
            .await?;

        // Stage 5: judge and score.
        let judge = self
            .judge_stage(&intended, &rendered, &ui_description, &agent_output, &store)
            .await?;

        let autoscore = autoscore(record, &tree)?;
        let score = score_document(
            &record.id,
            &self.model_label,
            &judge,
            &warnings,
            autoscore.as_ref(),
        );
        store.write_json("score.json", &score)?;
        store.write_json("meta.json", &self.meta(&record.id))?;

        let overall = score.get("overall").and_then(|v| v.as_f64());
        tracing::info!(record = %record.id, overall = ?overall, "record evaluated");
        Ok(RecordOutcome {
            record_id: record.id.clone(),
            overall,
            score,
        })
    }

    fn load_stage(&self, record: &Record, store: &ArtifactStore) -> Result<String, EvalError> {
        store.step_input(
            1,
            &json!({
                "recordId": record.id,
                "uiField": self.ui_field,
                "recordKeys": record_keys(&record.raw),
            }),
        )?;
        let ui_description = record
            .ui_description(&self.ui_field)
            .ok_or_else(|| anyhow::anyhow!("record {} has no UI description field", record.id))?;
        store.step_output(1, &artifacts::step1_summary(&record.id, &ui_description))?;
        store.write_json("record.json", &record.raw)?;
        store.write_text("ui_description.txt", &ui_description)?;
        Ok(ui_description)
    }

    async fn render_stage(
        &self,
        ui_description: &str,
        store: &ArtifactStore,
        warnings: &mut Vec<String>,
    ) -> Result<Value, EvalError> {
        // Probe before writing any stage-2 artifact: an unreachable tool
        // aborts with its own failure class.
        self.client
            .health(&self.tool_health_url)
            .await
            .map_err(|e| EvalError::ToolUnreachable {
                message: e.to_string(),
            })?;

        store.step_input(
            2,
            &json!({
                "toolName": self.tool_name,
                "toolEndpoint": self.tool_call_url,
                "uiDescriptionLength": ui_description.chars().count(),
            }),
        )?;

        let body = json!({
            "name": self.tool_name,
            "arguments": { "message": ui_description },
        });
        let raw = self
            .client
            .call_json(&self.tool_call_url, &body)
            .await
            .map_err(|e| map_tool_error(Stage::Render, e))?;

        let tree = normalize::normalize(raw);
        if normalize::is_empty_container(&tree) {
            let message = "tool returned an empty container tree".to_string();
            match self.empty_tree {
                EmptyTreePolicy::Fail => {
                    return Err(EvalError::ToolResponse { message });
                }
                EmptyTreePolicy::Warn => {
                    tracing::warn!("{message}");
                    warnings.push(message);
                }
            }
        }

        let rendered = tree.to_string();
        store.step_output(
            2,
            &json!({
                "agentOutputPreview": artifacts::preview(&rendered, 400),
                "agentOutputLength": rendered.chars().count(),
            }),
        )?;
        Ok(tree)
    }

    #[allow(clippy::too_many_arguments)]
    async fn interpret_stage(
        &self,
        stage: Stage,
        template: &str,
        vars: &[(&str, &str)],
        system: &str,
        prompt_artifact: &str,
        output_artifact: &str,
        store: &ArtifactStore,
    ) -> Result<Value, EvalError> {
        let filled = template::fill(template, vars)?;
        store.write_text(prompt_artifact, &filled)?;
        store.step_input(
            stage.step(),
            &json!({
                "stage": stage,
                "promptCharCount": filled.chars().count(),
            }),
        )?;

        let messages = [ChatMessage::system(system), ChatMessage::user(filled)];
        let parsed = self
            .client
            .chat(&self.model_url, &messages)
            .await
            .map_err(|e| map_model_error(stage, e))?;
        let object = require_object(stage, parsed)?;

        store.step_output(stage.step(), &object)?;
        store.write_json(output_artifact, &object)?;
        Ok(object)
    }

    async fn judge_stage(
        &self,
        intended: &Value,
        rendered: &Value,
        ui_description: &str,
        agent_output: &str,
        store: &ArtifactStore,
    ) -> Result<Value, EvalError> {
        let intended_json = intended.to_string();
        let rendered_json = rendered.to_string();
        let filled = template::fill(
            &self.prompts.judge,
            &[
                ("INTENDED_JSON", intended_json.as_str()),
                ("RENDERED_JSON", rendered_json.as_str()),
                ("UI_DESCRIPTION", ui_description),
                ("AGENT_OUTPUT", agent_output),
            ],
        )?;
        store.write_text("prompt_step5_judge.txt", &filled)?;
        store.step_input(
            5,
            &json!({
                "stage": Stage::Judge,
                "promptCharCount": filled.chars().count(),
                "intendedKeys": record_keys(intended),
                "renderedKeys": record_keys(rendered),
            }),
        )?;

        let messages = [ChatMessage::system(SYSTEM_JUDGE), ChatMessage::user(filled)];
        let parsed = self
            .client
            .chat(&self.model_url, &messages)
            .await
            .map_err(|e| map_model_error(Stage::Judge, e))?;
        let judge = finalize_judge(require_object(Stage::Judge, parsed)?)?;

        store.step_output(5, &judge)?;
        Ok(judge)
    }

    fn meta(&self, record_id: &str) -> Value {
        json!({
            "recordId": record_id,
            "timestamp": now_iso(),
            "model": self.model_label,
            "uiField": self.ui_field,
            "stepsCompleted": [1, 2, 3, 4, 5],
            "promptTemplates": {
                "intended": PROMPT_INTENDED,
                "rendered": PROMPT_RENDERED,
                "judge": PROMPT_JUDGE,
            },
        })
    }
}

/// Validate the judge object and fill a missing `overall` with the mean of
/// the numeric dimension scores, rounded to two decimals.
fn finalize_judge(mut judge: Value) -> Result<Value, EvalError> {
    let dimensions = judge
        .get("dimensionScores")
        .and_then(Value::as_object)
        .ok_or_else(|| EvalError::JudgeScores {
            message: "dimensionScores absent or not an object".to_string(),
        })?;

    if judge.get("overall").and_then(Value::as_f64).is_none() {
        let scores: Vec<f64> = dimensions.values().filter_map(Value::as_f64).collect();
        if scores.is_empty() {
            return Err(EvalError::JudgeScores {
                message: "no numeric dimension scores and no overall".to_string(),
            });
        }
        let mean = scores.iter().sum::<f64>() / scores.len() as f64;
        let rounded = (mean * 100.0).round() / 100.0;
        if let Value::Object(map) = &mut judge {
            map.insert("overall".to_string(), json!(rounded));
        }
    }
    Ok(judge)
}

/// Structural autoscore, applied when the record declares expectations.
fn autoscore(record: &Record, tree: &Value) -> Result<Option<Value>, EvalError> {
    let Some(declared) = record.raw.get("expected_components") else {
        return Ok(None);
    };
    let expected: Vec<ExpectedComponent> = serde_json::from_value(declared.clone())
        .map_err(|e| anyhow::anyhow!("record {}: invalid expected_components: {e}", record.id))?;
    let root = ComponentNode::from_value(tree);
    let nodes = root.flatten();
    let evals = matcher::evaluate(&expected, &nodes);
    let summary = matcher::summarize(&evals);
    Ok(Some(json!({
        "components": evals,
        "summary": summary,
    })))
}

fn score_document(
    record_id: &str,
    model: &str,
    judge: &Value,
    warnings: &[String],
    autoscore: Option<&Value>,
) -> Value {
    let mut doc = Map::new();
    doc.insert("recordId".to_string(), json!(record_id));
    doc.insert("timestamp".to_string(), json!(now_iso()));
    doc.insert("model".to_string(), json!(model));
    if let Value::Object(fields) = judge {
        for (key, value) in fields {
            doc.insert(key.clone(), value.clone());
        }
    }
    if !warnings.is_empty() {
        doc.insert("warnings".to_string(), json!(warnings));
    }
    if let Some(auto) = autoscore {
        doc.insert("autoscore".to_string(), auto.clone());
    }
    Value::Object(doc)
}

fn require_object(stage: Stage, value: Value) -> Result<Value, EvalError> {
    if value.is_object() {
        Ok(value)
    } else {
        Err(EvalError::ModelJson {
            stage,
            message: "model returned JSON but not an object".to_string(),
        })
    }
}

/// Tool-call failures: protocol violations get the tool-response class;
/// everything transport-shaped is a call failure for the stage.
fn map_tool_error(stage: Stage, error: CallError) -> EvalError {
    if error.is_protocol() {
        EvalError::ToolResponse {
            message: error.to_string(),
        }
    } else {
        EvalError::CallFailed {
            stage,
            source: error,
        }
    }
}

/// Model-call failures: a payload that arrived but was not usable JSON is
/// the model's contract violation; the rest is a call failure.
fn map_model_error(stage: Stage, error: CallError) -> EvalError {
    if error.is_protocol() {
        EvalError::ModelJson {
            stage,
            message: error.to_string(),
        }
    } else {
        EvalError::CallFailed {
            stage,
            source: error,
        }
    }
}

fn record_keys(value: &Value) -> Vec<String> {
    value
        .as_object()
        .map(|map| map.keys().cloned().collect())
        .unwrap_or_default()
}

fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}
