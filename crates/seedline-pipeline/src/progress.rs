//! Per-run progress bookkeeping.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use seedline_core::{Stage, StageResult, UnitStatus, WorkUnit, WorkUnitConfig};
use serde::Serialize;

/// Timestamps and outcome of one stage of one unit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageProgress {
    /// Stage being tracked
    pub stage: Stage,
    /// When the first attempt started
    pub started_at: DateTime<Utc>,
    /// When the stage finished, successfully or not
    pub finished_at: Option<DateTime<Utc>>,
    /// Final result, once finished
    pub result: Option<StageResult>,
}

/// Progress of one work unit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnitProgress {
    /// The tracked unit with its stage pointer and status
    pub unit: WorkUnit,
    /// Stages started so far, in execution order
    pub stages: Vec<StageProgress>,
    /// When the unit started
    pub started_at: Option<DateTime<Utc>>,
    /// When the unit reached a terminal status
    pub finished_at: Option<DateTime<Utc>>,
}

impl UnitProgress {
    fn new(config: WorkUnitConfig) -> Self {
        Self {
            unit: WorkUnit::new(config),
            stages: Vec::with_capacity(Stage::COUNT),
            started_at: None,
            finished_at: None,
        }
    }

    /// Number of stages that finished successfully.
    pub fn completed_stages(&self) -> usize {
        self.stages
            .iter()
            .filter(|stage| stage.result.as_ref().is_some_and(|result| result.success))
            .count()
    }

    /// Contribution of this unit to overall progress, in `0.0..=1.0`.
    ///
    /// Completed and failed units count as done. Others contribute the
    /// fraction of their stages that completed.
    pub fn fraction(&self) -> f64 {
        match self.unit.status {
            UnitStatus::Completed | UnitStatus::Failed => 1.0,
            UnitStatus::Pending | UnitStatus::Running | UnitStatus::Cancelled => {
                self.completed_stages() as f64 / Stage::COUNT as f64
            }
        }
    }

    /// Final results of every finished stage.
    pub fn results(&self) -> Vec<StageResult> {
        self.stages
            .iter()
            .filter_map(|stage| stage.result.clone())
            .collect()
    }
}

/// Tracks per-unit, per-stage progress for one run.
///
/// Only the run worker mutates a tracker; readers take a clone.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProgressTracker {
    units: Vec<UnitProgress>,
    #[serde(skip)]
    positions: HashMap<String, usize>,
}

impl ProgressTracker {
    /// Creates a tracker for `units`, kept in the given order.
    pub fn new(units: Vec<WorkUnitConfig>) -> Self {
        let positions = units
            .iter()
            .enumerate()
            .map(|(position, unit)| (unit.id.clone(), position))
            .collect();
        Self {
            units: units.into_iter().map(UnitProgress::new).collect(),
            positions,
        }
    }

    fn unit_mut(&mut self, unit_id: &str) -> Option<&mut UnitProgress> {
        let position = *self.positions.get(unit_id)?;
        self.units.get_mut(position)
    }

    /// Looks up a unit's progress.
    pub fn unit(&self, unit_id: &str) -> Option<&UnitProgress> {
        let position = *self.positions.get(unit_id)?;
        self.units.get(position)
    }

    /// All units in run order.
    pub fn units(&self) -> &[UnitProgress] {
        &self.units
    }

    /// Marks a unit as running.
    pub fn unit_started(&mut self, unit_id: &str) {
        if let Some(progress) = self.unit_mut(unit_id) {
            progress.unit.status = UnitStatus::Running;
            progress.started_at = Some(Utc::now());
        }
    }

    /// Records the start of a stage and advances the unit's stage pointer.
    ///
    /// Returns `false` if the unit is unknown or the stage would rewind it.
    pub fn stage_started(&mut self, unit_id: &str, stage: Stage) -> bool {
        let Some(progress) = self.unit_mut(unit_id) else {
            return false;
        };
        if !progress.unit.advance_to(stage) {
            return false;
        }
        progress.stages.push(StageProgress {
            stage,
            started_at: Utc::now(),
            finished_at: None,
            result: None,
        });
        true
    }

    /// Stores the final result of the unit's current stage.
    pub fn stage_finished(&mut self, unit_id: &str, result: StageResult) {
        let Some(progress) = self.unit_mut(unit_id) else {
            return;
        };
        if let Some(entry) = progress
            .stages
            .iter_mut()
            .rev()
            .find(|entry| entry.stage == result.stage && entry.result.is_none())
        {
            entry.finished_at = Some(Utc::now());
            entry.result = Some(result);
        }
    }

    /// Moves a unit to a terminal status.
    pub fn unit_finished(&mut self, unit_id: &str, status: UnitStatus) {
        if let Some(progress) = self.unit_mut(unit_id) {
            progress.unit.status = status;
            progress.finished_at = Some(Utc::now());
        }
    }

    /// Marks every unit that has not reached a terminal status as cancelled.
    pub fn cancel_remaining(&mut self) {
        let now = Utc::now();
        for progress in &mut self.units {
            if !progress.unit.status.is_terminal() {
                progress.unit.status = UnitStatus::Cancelled;
                progress.finished_at = Some(now);
            }
        }
    }

    /// Number of units with the given status.
    pub fn count(&self, status: UnitStatus) -> usize {
        self.units
            .iter()
            .filter(|progress| progress.unit.status == status)
            .count()
    }

    /// Overall progress in percent (`0.0..=100.0`).
    pub fn progress_percent(&self) -> f64 {
        if self.units.is_empty() {
            return 0.0;
        }
        let done: f64 = self.units.iter().map(UnitProgress::fraction).sum();
        done / self.units.len() as f64 * 100.0
    }
}
