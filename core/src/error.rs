use crate::expr::EvalError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AmlError {
    #[error("Configuration error in {scope}: {message}")]
    Configuration { scope: String, message: String },

    #[error("Evaluation error: {0}")]
    Evaluation(#[from] EvalError),

    #[error("Data quality error at {stage}: {message}")]
    DataQuality { stage: String, message: String },

    #[error("Empty input: no {what}")]
    EmptyInput { what: String },

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Run '{run_id}' not found")]
    RunNotFound { run_id: String },

    #[error("Run aborted after {completed} of {total} scenarios")]
    Aborted { completed: usize, total: usize },
}

impl AmlError {
    pub fn config(scope: impl Into<String>, message: impl Into<String>) -> Self {
        AmlError::Configuration {
            scope: scope.into(),
            message: message.into(),
        }
    }

    /// Short stable name for failure records and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            AmlError::Configuration { .. } => "configuration",
            AmlError::Evaluation(_) => "evaluation",
            AmlError::DataQuality { .. } => "data_quality",
            AmlError::EmptyInput { .. } => "empty_input",
            AmlError::Database(_) => "database",
            AmlError::Serialization(_) => "serialization",
            AmlError::RunNotFound { .. } => "run_not_found",
            AmlError::Aborted { .. } => "aborted",
        }
    }
}

pub type AmlResult<T> = Result<T, AmlError>;

// ── Per-unit failures ────────────────────────────────────────────────────────

/// The unit of work a failure is attributed to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "unit", content = "id", rename_all = "snake_case")]
pub enum FailedUnit {
    Scenario(String),
    Rule(String),
}

/// A scenario or rule that failed without taking its siblings down.
/// Collected into run results, never raised.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitFailure {
    pub unit: FailedUnit,
    pub kind: String,
    pub message: String,
}

impl UnitFailure {
    pub fn scenario(id: impl Into<String>, err: &AmlError) -> Self {
        Self {
            unit: FailedUnit::Scenario(id.into()),
            kind: err.kind().into(),
            message: err.to_string(),
        }
    }

    pub fn rule(id: impl Into<String>, err: &AmlError) -> Self {
        Self {
            unit: FailedUnit::Rule(id.into()),
            kind: err.kind().into(),
            message: err.to_string(),
        }
    }

    pub fn unit_id(&self) -> &str {
        match &self.unit {
            FailedUnit::Scenario(id) | FailedUnit::Rule(id) => id,
        }
    }
}
