//! Run lifecycle: start, pause, resume, cancel and status.
//!
//! Each run is driven by one background worker. The run state lives in a
//! `watch` channel so lifecycle calls are atomic transitions and the worker
//! can park at stage boundaries until the state moves away from `PAUSED`.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use seedline_core::{
    PipelineConfig, PipelineError, Result, RunState, Stage, UnitStatus, WorkUnitConfig,
};
use seedline_validation::ValidationConsensusEngine;
use tokio::runtime::Handle;
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::error_handler::{ErrorHandler, ErrorRecord};
use crate::run::{RunContext, RunStatus};
use crate::stage_runner::{Collaborators, StageOutcome, StagePayload, StageRunner};

/// State shared between the orchestrator and one run worker.
struct RunShared {
    run_id: String,
    state: watch::Sender<RunState>,
    finished: watch::Sender<bool>,
    context: Mutex<RunContext>,
}

impl RunShared {
    fn new(run_id: String, units: Vec<WorkUnitConfig>) -> Self {
        Self {
            context: Mutex::new(RunContext::new(run_id.clone(), units)),
            run_id,
            state: watch::Sender::new(RunState::Initializing),
            finished: watch::Sender::new(false),
        }
    }

    fn state(&self) -> RunState {
        *self.state.borrow()
    }

    /// Applies a write to the run context. Only the run worker calls this.
    fn update(&self, apply: impl FnOnce(&mut RunContext)) {
        let mut context = self.context.lock().unwrap_or_else(PoisonError::into_inner);
        apply(&mut context);
    }

    /// Moves from one of `allowed` to `target` atomically.
    fn transition(
        &self,
        action: &'static str,
        allowed: &[RunState],
        target: RunState,
    ) -> Result<()> {
        let mut rejected = None;
        let changed = self.state.send_if_modified(|state| {
            if allowed.contains(state) {
                *state = target;
                true
            } else {
                rejected = Some(*state);
                false
            }
        });

        if changed {
            info!("Run {}: {action} -> {target}", self.run_id);
            Ok(())
        } else {
            Err(PipelineError::InvalidState {
                action,
                state: rejected,
            })
        }
    }

    /// Ends the run as `FAILED` unless it already reached a terminal state.
    ///
    /// A paused run fails too: a stage that was in flight when the pause
    /// arrived may still report a fatal error.
    fn abort(&self, reason: &str) {
        let aborted = self.state.send_if_modified(|state| {
            if state.is_active() {
                *state = RunState::Failed;
                true
            } else {
                false
            }
        });
        if aborted {
            error!("Run {} aborted: {reason}", self.run_id);
        }
    }
}

/// Drives work units through the five pipeline stages on a background worker.
///
/// One orchestrator owns at most one active run. The context of the most
/// recent run stays readable through [`status`](Self::status) until the next
/// [`start`](Self::start) replaces it.
pub struct PipelineOrchestrator {
    units: HashMap<String, WorkUnitConfig>,
    unit_concurrency: usize,
    runner: Arc<StageRunner>,
    error_handler: Arc<ErrorHandler>,
    current: Mutex<Option<Arc<RunShared>>>,
}

impl PipelineOrchestrator {
    /// Creates an orchestrator for the work units declared in `config`.
    ///
    /// # Errors
    /// Returns a configuration error if `config` fails validation.
    pub fn new(
        config: &PipelineConfig,
        collaborators: Collaborators,
        engine: Arc<ValidationConsensusEngine>,
    ) -> Result<Self> {
        config.validate()?;

        let error_handler = Arc::new(ErrorHandler::new(
            config.retry.clone(),
            config.orchestrator.error_history_limit,
        ));
        let runner = Arc::new(StageRunner::new(
            collaborators,
            engine,
            Arc::clone(&error_handler),
            config.validation.strategy,
        ));

        Ok(Self {
            units: config
                .work_units
                .iter()
                .map(|unit| (unit.id.clone(), unit.clone()))
                .collect(),
            unit_concurrency: config.orchestrator.unit_concurrency,
            runner,
            error_handler,
            current: Mutex::new(None),
        })
    }

    /// The consensus engine used by the validate stage.
    pub fn engine(&self) -> &Arc<ValidationConsensusEngine> {
        self.runner.engine()
    }

    /// Starts a run over `unit_ids` on a background task and returns its id.
    ///
    /// A run id is generated when `run_id` is `None`. Must be called from
    /// within a tokio runtime.
    ///
    /// # Errors
    /// Returns a configuration error if `unit_ids` is empty, contains
    /// duplicates or names an unconfigured unit, or if no runtime is
    /// available. Returns an invalid-state error while another run is active.
    pub fn start(&self, unit_ids: &[String], run_id: Option<String>) -> Result<String> {
        let units = self.resolve_units(unit_ids)?;
        let runtime = Handle::try_current().map_err(|err| {
            PipelineError::Configuration(format!("start requires a tokio runtime: {err}"))
        })?;

        let mut current = self.current.lock().map_err(|_poisoned| {
            PipelineError::FatalRun("orchestrator state lock poisoned".to_owned())
        })?;
        if let Some(run) = current.as_ref() {
            let state = run.state();
            if state.is_active() {
                return Err(PipelineError::InvalidState {
                    action: "start",
                    state: Some(state),
                });
            }
        }

        let run_id = run_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let shared = Arc::new(RunShared::new(run_id.clone(), units.clone()));
        *current = Some(Arc::clone(&shared));
        drop(current);

        shared.state.send_modify(|state| *state = RunState::Running);
        info!("Run {run_id} started with {} work units", units.len());

        let worker = RunWorker {
            shared,
            runner: Arc::clone(&self.runner),
            units,
            unit_concurrency: self.unit_concurrency,
        };
        runtime.spawn(worker.run());

        Ok(run_id)
    }

    fn resolve_units(&self, unit_ids: &[String]) -> Result<Vec<WorkUnitConfig>> {
        if unit_ids.is_empty() {
            return Err(PipelineError::Configuration(
                "at least one work unit is required".to_owned(),
            ));
        }

        let mut seen = HashSet::with_capacity(unit_ids.len());
        unit_ids
            .iter()
            .map(|unit_id| {
                if !seen.insert(unit_id.as_str()) {
                    return Err(PipelineError::Configuration(format!(
                        "work unit {unit_id} listed more than once"
                    )));
                }
                self.units.get(unit_id).cloned().ok_or_else(|| {
                    PipelineError::Configuration(format!("unknown work unit: {unit_id}"))
                })
            })
            .collect()
    }

    fn current_run(&self) -> Option<Arc<RunShared>> {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(Arc::clone)
    }

    fn transition(
        &self,
        action: &'static str,
        allowed: &[RunState],
        target: RunState,
    ) -> Result<()> {
        let run = self
            .current_run()
            .ok_or(PipelineError::InvalidState {
                action,
                state: None,
            })?;
        run.transition(action, allowed, target)
    }

    /// Pauses the run at the next stage boundary.
    ///
    /// # Errors
    /// Returns an invalid-state error unless the run is `RUNNING`.
    pub fn pause(&self) -> Result<()> {
        self.transition("pause", &[RunState::Running], RunState::Paused)
    }

    /// Resumes a paused run.
    ///
    /// # Errors
    /// Returns an invalid-state error unless the run is `PAUSED`.
    pub fn resume(&self) -> Result<()> {
        self.transition("resume", &[RunState::Paused], RunState::Running)
    }

    /// Cancels the run. In-flight stages finish; nothing new starts.
    ///
    /// # Errors
    /// Returns an invalid-state error unless the run is `RUNNING` or `PAUSED`.
    pub fn cancel(&self) -> Result<()> {
        self.transition(
            "cancel",
            &[RunState::Running, RunState::Paused],
            RunState::Cancelled,
        )
    }

    /// Snapshot of the current or most recent run. Every field is empty when
    /// no run was ever started.
    pub fn status(&self) -> RunStatus {
        self.current_run()
            .map_or_else(RunStatus::default, |run| self.snapshot(&run))
    }

    fn snapshot(&self, run: &RunShared) -> RunStatus {
        let state = run.state();
        let last_error = self.error_handler.last_for_run(&run.run_id);
        let context = run.context.lock().unwrap_or_else(PoisonError::into_inner);
        context.snapshot(state, last_error)
    }

    /// Waits until the current run's worker has fully finished and returns
    /// its final status.
    ///
    /// # Errors
    /// Returns an invalid-state error if no run was ever started.
    pub async fn wait(&self) -> Result<RunStatus> {
        let run = self
            .current_run()
            .ok_or(PipelineError::InvalidState {
                action: "wait",
                state: None,
            })?;

        let mut finished = run.finished.subscribe();
        if finished.wait_for(|done| *done).await.is_err() {
            return Err(PipelineError::FatalRun(
                "run worker stopped without finishing".to_owned(),
            ));
        }

        Ok(self.snapshot(&run))
    }

    /// Every retained error record, oldest first.
    pub fn error_history(&self) -> Vec<ErrorRecord> {
        self.error_handler.history()
    }

    /// Up to `limit` most recent error records, oldest first.
    pub fn recent_errors(&self, limit: usize) -> Vec<ErrorRecord> {
        self.error_handler.recent(limit)
    }
}

/// How a unit's processing ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UnitOutcome {
    Completed,
    Failed,
    Aborted,
    /// Stopped at a stage boundary by cancellation or an abort elsewhere
    Stopped,
}

/// Background worker for one run.
struct RunWorker {
    shared: Arc<RunShared>,
    runner: Arc<StageRunner>,
    units: Vec<WorkUnitConfig>,
    unit_concurrency: usize,
}

impl RunWorker {
    async fn run(self) {
        let Self {
            shared,
            runner,
            units,
            unit_concurrency,
        } = self;

        let mut state = shared.state.subscribe();
        let semaphore = Arc::new(Semaphore::new(unit_concurrency.max(1)));
        let mut join_set = JoinSet::new();

        // Units start in the given order; a permit frees up only when a
        // previous unit finishes.
        for unit in units {
            let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
                break;
            };
            if !checkpoint(&mut state).await {
                break;
            }

            let unit_shared = Arc::clone(&shared);
            let unit_runner = Arc::clone(&runner);
            join_set.spawn(async move {
                let outcome = process_unit(&unit_shared, &unit_runner, &unit).await;
                drop(permit);
                outcome
            });
        }

        let mut outcomes = Vec::new();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(outcome) => outcomes.push(outcome),
                Err(err) => {
                    error!("Unit task in run {} ended abnormally: {err}", shared.run_id);
                    outcomes.push(UnitOutcome::Failed);
                }
            }
        }

        finalize(&shared, &mut state, &outcomes).await;
    }
}

/// Stage boundary check. Parks while the run is paused and returns whether
/// the run may continue.
async fn checkpoint(state: &mut watch::Receiver<RunState>) -> bool {
    if *state.borrow() == RunState::Paused {
        debug!("Run paused, waiting at stage boundary");
    }
    state
        .wait_for(|current| *current != RunState::Paused)
        .await
        .is_ok_and(|current| *current == RunState::Running)
}

async fn process_unit(
    shared: &RunShared,
    runner: &StageRunner,
    unit: &WorkUnitConfig,
) -> UnitOutcome {
    let mut state = shared.state.subscribe();
    let unit_id = unit.id.as_str();
    let mut payload = StagePayload::Empty;

    for stage in Stage::ALL {
        if !checkpoint(&mut state).await {
            info!("Unit {unit_id} stopped before {stage}");
            return UnitOutcome::Stopped;
        }

        shared.update(|context| {
            if stage == Stage::Collect {
                context.progress.unit_started(unit_id);
                info!("Unit {unit_id} started");
            }
            context.current_unit = Some(unit_id.to_owned());
            context.current_stage = Some(stage);
            context.progress.stage_started(unit_id, stage);
        });

        match runner
            .run_stage(&shared.run_id, unit, stage, payload)
            .await
        {
            StageOutcome::Completed {
                result,
                payload: next,
            } => {
                shared.update(|context| context.progress.stage_finished(unit_id, result));
                payload = next;
            }
            StageOutcome::UnitFailed { result } => {
                shared.update(|context| {
                    context.progress.stage_finished(unit_id, result);
                    context.progress.unit_finished(unit_id, UnitStatus::Failed);
                });
                return UnitOutcome::Failed;
            }
            StageOutcome::RunAborted { result, reason } => {
                shared.update(|context| {
                    context.progress.stage_finished(unit_id, result);
                    context.progress.unit_finished(unit_id, UnitStatus::Failed);
                });
                shared.abort(&reason);
                return UnitOutcome::Aborted;
            }
        }
    }

    shared.update(|context| context.progress.unit_finished(unit_id, UnitStatus::Completed));
    info!("Unit {unit_id} completed");
    UnitOutcome::Completed
}

/// Settles the final run state once every unit task has returned.
async fn finalize(
    shared: &RunShared,
    state: &mut watch::Receiver<RunState>,
    outcomes: &[UnitOutcome],
) {
    let completed = outcomes
        .iter()
        .filter(|outcome| **outcome == UnitOutcome::Completed)
        .count();
    let failed = outcomes
        .iter()
        .filter(|outcome| matches!(outcome, UnitOutcome::Failed | UnitOutcome::Aborted))
        .count();

    // A pause that arrived during the last stage is honored before finishing.
    let settled = state
        .wait_for(|current| *current != RunState::Paused)
        .await
        .map_or(RunState::Failed, |current| *current);

    if settled == RunState::Running {
        let target = if completed == 0 {
            RunState::Failed
        } else {
            RunState::Completed
        };
        shared.state.send_if_modified(|current| {
            if *current == RunState::Running {
                *current = target;
                true
            } else {
                false
            }
        });
    }

    let final_state = shared.state();
    shared.update(|context| {
        if final_state != RunState::Completed {
            context.progress.cancel_remaining();
        }
        context.finished_at = Some(Utc::now());
    });

    info!(
        "Run {} finished {final_state}: {completed} completed, {failed} failed",
        shared.run_id
    );
    shared.finished.send_modify(|done| *done = true);
}
