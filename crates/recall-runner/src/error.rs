use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, RunnerError>;

#[derive(Debug, Error)]
pub enum RunnerError {
    /// Pool too small, block count out of range, malformed identifiers.
    /// Always raised before anything is written to the session directory.
    #[error("configuration_error: {0}")]
    Configuration(String),

    /// The constraint cannot hold for any arrangement of the given input.
    #[error("constraint_infeasible: {constraint}: {reason}")]
    ConstraintInfeasible {
        constraint: &'static str,
        reason: String,
    },

    /// Sampling gave up after the attempt bound. Feasible but unlucky, or the
    /// bound is too tight for the acceptance rate of the constraint.
    #[error("constraint_unsatisfied: {constraint} not met after {attempts} attempts")]
    ConstraintUnsatisfied {
        constraint: &'static str,
        attempts: usize,
    },

    #[error("checkpoint_integrity: {path} line {line}: {reason}")]
    CheckpointIntegrity {
        path: PathBuf,
        line: u64,
        reason: String,
    },

    #[error("session_incomplete: {0}")]
    SessionIncomplete(String),

    #[error("protocol_error: {0}")]
    Protocol(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Csv(#[from] csv::Error),
}

impl RunnerError {
    pub fn config(message: impl Into<String>) -> Self {
        RunnerError::Configuration(message.into())
    }

    /// Short machine-readable code, matching the prefix of the display form.
    pub fn code(&self) -> &'static str {
        match self {
            RunnerError::Configuration(_) => "configuration_error",
            RunnerError::ConstraintInfeasible { .. } => "constraint_infeasible",
            RunnerError::ConstraintUnsatisfied { .. } => "constraint_unsatisfied",
            RunnerError::CheckpointIntegrity { .. } => "checkpoint_integrity",
            RunnerError::SessionIncomplete(_) => "session_incomplete",
            RunnerError::Protocol(_) => "protocol_error",
            RunnerError::Io(_) => "io_error",
            RunnerError::Json(_) => "json_error",
            RunnerError::Yaml(_) => "yaml_error",
            RunnerError::Csv(_) => "csv_error",
        }
    }
}
