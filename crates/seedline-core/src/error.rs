//! Error taxonomy shared by every seedline crate.

use core::result::Result as CoreResult;
use std::io::Error as IoError;

use serde::{Deserialize, Serialize};
use serde_json::Error as SerdeJsonError;
use thiserror::Error;
use toml::de::Error as TomlDeError;
use toml::ser::Error as TomlSerError;

use crate::types::{RunState, Stage};

/// Result type for pipeline operations.
pub type Result<T> = CoreResult<T, PipelineError>;

/// Errors that can occur while configuring or running the pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Configuration is invalid, incomplete or references unknown work units.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A lifecycle operation was requested from a state that does not allow it.
    #[error("Cannot {action} while run is {}", describe_state(.state.as_ref()))]
    InvalidState {
        /// Lifecycle operation that was rejected
        action: &'static str,
        /// Run state at the time of the request, `None` when no run exists
        state: Option<RunState>,
    },

    /// A stage failed in a way that may succeed if retried.
    #[error("Transient failure in {stage} stage: {message}")]
    TransientStage {
        /// Stage that failed
        stage: Stage,
        /// Failure description
        message: String,
    },

    /// A stage failed in a way that retrying will not fix.
    #[error("{stage} stage failed: {message}")]
    StageFailed {
        /// Stage that failed
        stage: Stage,
        /// Failure description
        message: String,
    },

    /// A validator malfunctioned while judging candidates.
    #[error("Validator {validator} failed: {message}")]
    Validator {
        /// Name of the failing validator
        validator: String,
        /// Failure description
        message: String,
    },

    /// A stage attempt exceeded its time budget.
    #[error("{stage} stage timed out after {millis}ms")]
    Timeout {
        /// Stage that timed out
        stage: Stage,
        /// Elapsed budget in milliseconds
        millis: u64,
    },

    /// An unrecoverable error that aborts the whole run.
    #[error("Fatal run error: {0}")]
    FatalRun(String),

    /// An I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] IoError),

    /// JSON serialization or deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] SerdeJsonError),

    /// TOML deserialization failed.
    #[error("TOML deserialization error: {0}")]
    TomlDe(#[from] TomlDeError),

    /// TOML serialization failed.
    #[error("TOML serialization error: {0}")]
    TomlSer(#[from] TomlSerError),
}

/// How the error handler treats a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Eligible for bounded retry before the unit is marked failed
    Transient,
    /// Raised by a validator; absorbed inside the consensus engine
    ValidatorInternal,
    /// Fails the current unit without retrying
    Permanent,
    /// Configuration or programming error; aborts the run
    Fatal,
}

impl ErrorClass {
    /// Snake-case class name used in logs and stage metadata.
    pub fn name(self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::ValidatorInternal => "validator_internal",
            Self::Permanent => "permanent",
            Self::Fatal => "fatal",
        }
    }
}

impl PipelineError {
    /// Creates a transient stage error.
    pub fn transient(stage: Stage, message: impl Into<String>) -> Self {
        Self::TransientStage {
            stage,
            message: message.into(),
        }
    }

    /// Creates a non-retryable stage error.
    pub fn stage_failed(stage: Stage, message: impl Into<String>) -> Self {
        Self::StageFailed {
            stage,
            message: message.into(),
        }
    }

    /// Creates a validator error.
    pub fn validator(validator: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validator {
            validator: validator.into(),
            message: message.into(),
        }
    }

    /// Determines whether this error may succeed if retried.
    ///
    /// Returns `true` for transient stage failures, timeouts and I/O errors.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::TransientStage { .. } | Self::Timeout { .. } | Self::Io(_)
        )
    }

    /// Classifies this error for the error handler.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::TransientStage { .. } | Self::Timeout { .. } | Self::Io(_) => {
                ErrorClass::Transient
            }
            Self::Validator { .. } => ErrorClass::ValidatorInternal,
            Self::StageFailed { .. } | Self::Json(_) => ErrorClass::Permanent,
            Self::Configuration(_)
            | Self::InvalidState { .. }
            | Self::FatalRun(_)
            | Self::TomlDe(_)
            | Self::TomlSer(_) => ErrorClass::Fatal,
        }
    }
}

fn describe_state(state: Option<&RunState>) -> String {
    state.map_or_else(|| "not started".to_owned(), ToString::to_string)
}
