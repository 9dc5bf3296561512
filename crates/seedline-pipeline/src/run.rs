//! Run context owned by the background worker and the snapshots handed to
//! callers.

use chrono::{DateTime, Utc};
use seedline_core::{RunState, Stage, StageResult, UnitStatus, WorkUnitConfig};
use serde::Serialize;

use crate::error_handler::ErrorRecord;
use crate::progress::{ProgressTracker, UnitProgress};

/// Mutable state of one run. Written only by the run worker.
#[derive(Debug, Clone)]
pub struct RunContext {
    /// Run identifier
    pub run_id: String,
    /// When `start` created the run
    pub started_at: DateTime<Utc>,
    /// When the run reached a terminal state
    pub finished_at: Option<DateTime<Utc>>,
    /// Unit most recently started
    pub current_unit: Option<String>,
    /// Stage most recently started
    pub current_stage: Option<Stage>,
    /// Per-unit progress in run order
    pub progress: ProgressTracker,
}

impl RunContext {
    /// Creates the context for a new run over `units`.
    pub fn new(run_id: String, units: Vec<WorkUnitConfig>) -> Self {
        Self {
            run_id,
            started_at: Utc::now(),
            finished_at: None,
            current_unit: None,
            current_stage: None,
            progress: ProgressTracker::new(units),
        }
    }

    /// Builds an immutable snapshot for callers.
    pub fn snapshot(&self, state: RunState, last_error: Option<ErrorRecord>) -> RunStatus {
        RunStatus {
            state: Some(state),
            run_id: Some(self.run_id.clone()),
            current_unit: self.current_unit.clone(),
            current_stage: self.current_stage,
            progress_percent: self.progress.progress_percent(),
            units: self
                .progress
                .units()
                .iter()
                .map(UnitSummary::from_progress)
                .collect(),
            last_error,
            started_at: Some(self.started_at),
            finished_at: self.finished_at,
        }
    }
}

/// Summary of one unit inside a [`RunStatus`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnitSummary {
    /// Unit identifier
    pub unit_id: String,
    /// Processing status
    pub status: UnitStatus,
    /// Most recent stage started
    pub current_stage: Option<Stage>,
    /// Stages that finished successfully
    pub completed_stages: usize,
    /// Final result of every finished stage, in order
    pub results: Vec<StageResult>,
    /// When the unit started
    pub started_at: Option<DateTime<Utc>>,
    /// When the unit reached a terminal status
    pub finished_at: Option<DateTime<Utc>>,
}

impl UnitSummary {
    fn from_progress(progress: &UnitProgress) -> Self {
        Self {
            unit_id: progress.unit.id().to_owned(),
            status: progress.unit.status,
            current_stage: progress.unit.current_stage,
            completed_stages: progress.completed_stages(),
            results: progress.results(),
            started_at: progress.started_at,
            finished_at: progress.finished_at,
        }
    }
}

/// Point-in-time view of the current or most recent run.
///
/// Every field is empty when no run was ever started.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunStatus {
    /// Run state
    pub state: Option<RunState>,
    /// Run identifier
    pub run_id: Option<String>,
    /// Unit most recently started
    pub current_unit: Option<String>,
    /// Stage most recently started
    pub current_stage: Option<Stage>,
    /// Overall progress in percent
    pub progress_percent: f64,
    /// Per-unit summaries in run order
    pub units: Vec<UnitSummary>,
    /// Most recent error recorded for this run
    pub last_error: Option<ErrorRecord>,
    /// When the run started
    pub started_at: Option<DateTime<Utc>>,
    /// When the run reached a terminal state
    pub finished_at: Option<DateTime<Utc>>,
}

impl RunStatus {
    /// Summary of one unit, if it belongs to this run.
    pub fn unit(&self, unit_id: &str) -> Option<&UnitSummary> {
        self.units.iter().find(|unit| unit.unit_id == unit_id)
    }

    /// Number of units with the given status.
    pub fn count(&self, status: UnitStatus) -> usize {
        self.units.iter().filter(|unit| unit.status == status).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_status_is_empty() {
        let status = RunStatus::default();
        assert!(status.state.is_none());
        assert!(status.run_id.is_none());
        assert!(status.units.is_empty());
        assert!(status.progress_percent.abs() < f64::EPSILON);
    }

    #[test]
    fn test_snapshot_copies_progress() {
        let mut context = RunContext::new(
            "run-1".to_owned(),
            vec![WorkUnitConfig::new("pets"), WorkUnitConfig::new("garden")],
        );
        context.current_unit = Some("pets".to_owned());
        context.current_stage = Some(Stage::Collect);
        context.progress.unit_started("pets");
        context.progress.stage_started("pets", Stage::Collect);

        let status = context.snapshot(RunState::Running, None);
        // Later writes do not leak into the snapshot.
        context.progress.unit_finished("pets", UnitStatus::Failed);

        assert_eq!(status.state, Some(RunState::Running));
        assert_eq!(status.run_id.as_deref(), Some("run-1"));
        assert_eq!(status.units.len(), 2);
        assert_eq!(status.unit("pets").map(|unit| unit.status), Some(UnitStatus::Running));
        assert_eq!(status.count(UnitStatus::Pending), 1);
    }
}
