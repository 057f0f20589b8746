use std::path::PathBuf;
use thiserror::Error;

use crate::client::CallError;
use crate::pipeline::Stage;

// ─── Top-level error hierarchy ───────────────────────────────────────────────

/// Structured error hierarchy for `uxeval`.
///
/// Each variant corresponds to one branch of the failure taxonomy: fatal
/// configuration problems, per-record call failures, protocol violations by
/// the tool or model, and domain failures in the judge output. Callers map
/// these to distinct process exit codes via [`EvalError::exit_code`].
#[derive(Debug, Error)]
pub enum EvalError {
    // ── Configuration (aborts the whole run) ────────────────────────────
    #[error("config: {0}")]
    Config(#[from] ConfigError),

    #[error("missing prompt template: {}", .0.display())]
    PromptMissing(PathBuf),

    // ── Tool endpoint health (distinct from a call failure) ─────────────
    #[error("tool endpoint unhealthy: {message}")]
    ToolUnreachable { message: String },

    // ── Transient-network exhausted / transport ─────────────────────────
    #[error("{stage}: call failed: {source}")]
    CallFailed { stage: Stage, source: CallError },

    // ── Protocol: tool did not honor its contract ───────────────────────
    #[error("render: tool response malformed: {message}")]
    ToolResponse { message: String },

    // ── Protocol: model did not honor the JSON-only contract ────────────
    #[error("{stage}: model did not return well-formed JSON: {message}")]
    ModelJson { stage: Stage, message: String },

    // ── Domain: judge output unusable ───────────────────────────────────
    #[error("judge response missing required score fields: {message}")]
    JudgeScores { message: String },

    // ── Generic fallthrough (wraps anyhow for interop) ──────────────────
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl EvalError {
    /// Process exit code for this failure. Code 0 is reserved for full
    /// success of all five stages; each taxonomy branch gets its own
    /// non-zero code so callers can diagnose without re-running.
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Config(_) => 2,
            Self::PromptMissing(_) => 3,
            Self::ToolUnreachable { .. } => 4,
            Self::CallFailed { .. } => 5,
            Self::ToolResponse { .. } => 6,
            Self::ModelJson { .. } => 7,
            Self::JudgeScores { .. } => 8,
            Self::Other(_) => 1,
        }
    }

    /// True when the failure aborts the whole run rather than one record.
    pub fn is_fatal_for_run(&self) -> bool {
        matches!(self, Self::Config(_) | Self::PromptMissing(_))
    }
}

// ─── Config errors ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("required setting missing: {0}")]
    Missing(String),

    #[error("invalid setting: {0}")]
    Invalid(String),

    #[error("failed to load config: {0}")]
    Load(String),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Shorthand result type for the crate.
pub type Result<T> = std::result::Result<T, EvalError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_are_distinct() {
        let errors = [
            EvalError::Config(ConfigError::Missing("tool.endpoint".into())),
            EvalError::PromptMissing(PathBuf::from("prompts/judge.txt")),
            EvalError::ToolUnreachable {
                message: "503".into(),
            },
            EvalError::CallFailed {
                stage: Stage::Render,
                source: CallError::RetriesExhausted {
                    attempts: 4,
                    last: "429".into(),
                },
            },
            EvalError::ToolResponse {
                message: "not json".into(),
            },
            EvalError::ModelJson {
                stage: Stage::Judge,
                message: "content was prose".into(),
            },
            EvalError::JudgeScores {
                message: "dimensionScores absent".into(),
            },
            EvalError::Other(anyhow::anyhow!("boom")),
        ];
        let mut codes: Vec<u8> = errors.iter().map(EvalError::exit_code).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
        assert!(!codes.contains(&0));
    }

    #[test]
    fn config_errors_are_run_fatal() {
        let err = EvalError::Config(ConfigError::Missing("model.endpoint".into()));
        assert!(err.is_fatal_for_run());

        let err = EvalError::ToolUnreachable {
            message: "connection refused".into(),
        };
        assert!(!err.is_fatal_for_run());
    }

    #[test]
    fn stage_tag_appears_in_message() {
        let err = EvalError::ModelJson {
            stage: Stage::InterpretIntended,
            message: "trailing prose".into(),
        };
        assert!(err.to_string().contains("interpret_intended"));
    }

    #[test]
    fn anyhow_interop() {
        let err: EvalError = anyhow::anyhow!("something went wrong").into();
        assert!(err.to_string().contains("something went wrong"));
        assert_eq!(err.exit_code(), 1);
    }
}
