//! Pipeline orchestration for seedline.
//!
//! A [`PipelineOrchestrator`] drives each work unit through the fixed stage
//! sequence collect → validate → process → fill → export on a background
//! worker, exposing start/pause/resume/cancel/status to the caller. The
//! [`StageRunner`] executes single stages with retries and routes the
//! validate stage through the consensus engine; the [`ProgressTracker`] and
//! [`ErrorHandler`] keep per-run progress and a bounded failure history.

/// Failure classification, retry decisions and error history.
pub mod error_handler;
/// Run lifecycle and the background run worker.
pub mod orchestrator;
/// Per-unit, per-stage progress tracking.
pub mod progress;
/// Run context and status snapshots.
pub mod run;
/// Single-stage execution with retries and timeouts.
pub mod stage_runner;

pub use error_handler::{ErrorAction, ErrorContext, ErrorHandler, ErrorRecord};
pub use orchestrator::PipelineOrchestrator;
pub use progress::{ProgressTracker, StageProgress, UnitProgress};
pub use run::{RunContext, RunStatus, UnitSummary};
pub use stage_runner::{Collaborators, StageOutcome, StagePayload, StageRunner};
