//! LLM-judged evaluation pipeline for machine-generated UI compositions.
//!
//! A record's natural-language UI description is rendered to a component
//! tree by an external tool, interpreted twice by a model (intended and
//! rendered), and scored by a judge model; optional declarative
//! expectations are scored structurally. Every stage persists its inputs
//! and outputs so a failed record leaves a full trace.

pub mod cli;
pub mod client;
pub mod config;
pub mod dataset;
pub mod error;
pub mod matcher;
pub mod normalize;
pub mod pipeline;
pub mod run;

pub use error::{EvalError, Result};
