//! Executes one stage of one work unit with retries and timeouts.

use core::time::Duration;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use seedline_core::{
    Artifact, Candidate, Collector, ConsensusStrategy, Exporter, Filler, PipelineError, Processor,
    Result, Stage, StageResult, WorkUnitConfig, dedupe_candidates,
};
use seedline_validation::ValidationConsensusEngine;
use serde_json::Value;
use tokio::time::{sleep, timeout};
use tracing::debug;

use crate::error_handler::{ErrorAction, ErrorContext, ErrorHandler};

/// The external collaborators driving the non-validation stages.
#[derive(Clone)]
pub struct Collaborators {
    /// Collect stage
    pub collector: Arc<dyn Collector>,
    /// Process stage
    pub processor: Arc<dyn Processor>,
    /// Fill stage
    pub filler: Arc<dyn Filler>,
    /// Export stage
    pub exporter: Arc<dyn Exporter>,
}

impl Collaborators {
    /// Bundles the four collaborators.
    pub fn new(
        collector: Arc<dyn Collector>,
        processor: Arc<dyn Processor>,
        filler: Arc<dyn Filler>,
        exporter: Arc<dyn Exporter>,
    ) -> Self {
        Self {
            collector,
            processor,
            filler,
            exporter,
        }
    }
}

/// Data handed from one stage to the next.
#[derive(Debug, Clone, PartialEq)]
pub enum StagePayload {
    /// Nothing yet; input of the collect stage
    Empty,
    /// Candidates from collect or validate
    Candidates(Vec<Candidate>),
    /// Artifact from process or fill
    Artifact(Artifact),
    /// Reference returned by the exporter
    Exported(String),
}

impl StagePayload {
    fn describe(&self) -> &'static str {
        match self {
            Self::Empty => "empty",
            Self::Candidates(_) => "candidate",
            Self::Artifact(_) => "artifact",
            Self::Exported(_) => "exported",
        }
    }
}

/// Result of running one stage to completion (including retries).
#[derive(Debug)]
pub enum StageOutcome {
    /// The stage succeeded; `payload` feeds the next stage
    Completed {
        /// Stage result to report
        result: StageResult,
        /// Output for the next stage
        payload: StagePayload,
    },
    /// The stage failed for good; the unit is abandoned
    UnitFailed {
        /// Stage result to report
        result: StageResult,
    },
    /// A fatal error that must abort the whole run
    RunAborted {
        /// Stage result to report
        result: StageResult,
        /// Rendered fatal error
        reason: String,
    },
}

/// Successful output of one attempt.
struct AttemptOutput {
    payload: StagePayload,
    artifact: Option<String>,
    metadata: BTreeMap<String, Value>,
}

impl AttemptOutput {
    fn new(payload: StagePayload) -> Self {
        Self {
            payload,
            artifact: None,
            metadata: BTreeMap::new(),
        }
    }

    fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_owned(), value.into());
        self
    }
}

/// Runs single stages for single units.
///
/// The validate stage goes through the consensus engine using the unit's
/// strategy override, or the default strategy otherwise. Failures are handed
/// to the [`ErrorHandler`], which decides between retrying, failing the unit
/// and aborting the run.
pub struct StageRunner {
    collaborators: Collaborators,
    engine: Arc<ValidationConsensusEngine>,
    error_handler: Arc<ErrorHandler>,
    default_strategy: ConsensusStrategy,
    stage_timeout: Option<Duration>,
}

impl StageRunner {
    /// Creates a runner.
    pub fn new(
        collaborators: Collaborators,
        engine: Arc<ValidationConsensusEngine>,
        error_handler: Arc<ErrorHandler>,
        default_strategy: ConsensusStrategy,
    ) -> Self {
        let stage_timeout = error_handler.retry_policy().stage_timeout();
        Self {
            collaborators,
            engine,
            error_handler,
            default_strategy,
            stage_timeout,
        }
    }

    /// The consensus engine used by the validate stage.
    pub fn engine(&self) -> &Arc<ValidationConsensusEngine> {
        &self.engine
    }

    /// Strategy the validate stage uses for `unit`.
    pub fn strategy_for(&self, unit: &WorkUnitConfig) -> ConsensusStrategy {
        unit.strategy.unwrap_or(self.default_strategy)
    }

    /// Runs `stage` for `unit` until it succeeds or the error handler gives up.
    pub async fn run_stage(
        &self,
        run_id: &str,
        unit: &WorkUnitConfig,
        stage: Stage,
        input: StagePayload,
    ) -> StageOutcome {
        let started = Instant::now();
        let mut attempt = 1;

        loop {
            match self.attempt(unit, stage, &input).await {
                Ok(output) => {
                    let elapsed = elapsed_ms(started);
                    debug!("Unit {} finished {stage} in {elapsed}ms (attempt {attempt})", unit.id);

                    let mut result = StageResult::succeeded(stage, elapsed, attempt);
                    result.artifact = output.artifact;
                    result.metadata = output.metadata;
                    return StageOutcome::Completed {
                        result,
                        payload: output.payload,
                    };
                }
                Err(failure) => {
                    let context = ErrorContext::stage(run_id, &unit.id, stage, attempt);
                    match self.error_handler.handle(&context, &failure) {
                        ErrorAction::Retry { delay } => {
                            sleep(delay).await;
                            attempt += 1;
                        }
                        ErrorAction::FailUnit => {
                            let result = StageResult::failed(
                                stage,
                                elapsed_ms(started),
                                attempt,
                                &failure.to_string(),
                            )
                            .with_metadata("class", ErrorHandler::classify(&failure).name());
                            return StageOutcome::UnitFailed { result };
                        }
                        ErrorAction::AbortRun => {
                            let reason = failure.to_string();
                            let result =
                                StageResult::failed(stage, elapsed_ms(started), attempt, &reason)
                                    .with_metadata("class", ErrorHandler::classify(&failure).name());
                            return StageOutcome::RunAborted { result, reason };
                        }
                    }
                }
            }
        }
    }

    /// One attempt, bounded by the stage timeout when configured.
    async fn attempt(
        &self,
        unit: &WorkUnitConfig,
        stage: Stage,
        input: &StagePayload,
    ) -> Result<AttemptOutput> {
        let work = self.execute(unit, stage, input);
        match self.stage_timeout {
            Some(limit) => timeout(limit, work).await.map_err(|_elapsed| PipelineError::Timeout {
                stage,
                millis: u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
            })?,
            None => work.await,
        }
    }

    async fn execute(
        &self,
        unit: &WorkUnitConfig,
        stage: Stage,
        input: &StagePayload,
    ) -> Result<AttemptOutput> {
        match (stage, input) {
            (Stage::Collect, StagePayload::Empty) => {
                let raw = self.collaborators.collector.collect(unit).await?;
                let collected = raw.len();
                let candidates = dedupe_candidates(raw);
                let unique = candidates.len();
                Ok(AttemptOutput::new(StagePayload::Candidates(candidates))
                    .with("collected", collected)
                    .with("unique", unique))
            }
            (Stage::Validate, StagePayload::Candidates(candidates)) => {
                let strategy = self.strategy_for(unit);
                let approved = self.engine.validate(candidates, strategy).await;
                let count = approved.len();
                Ok(AttemptOutput::new(StagePayload::Candidates(approved))
                    .with("strategy", strategy.name())
                    .with("input", candidates.len())
                    .with("approved", count))
            }
            (Stage::Process, StagePayload::Candidates(candidates)) => {
                let artifact = self
                    .collaborators
                    .processor
                    .process(unit, candidates)
                    .await?;
                let kind = artifact.kind.clone();
                Ok(AttemptOutput::new(StagePayload::Artifact(artifact))
                    .with("candidates", candidates.len())
                    .with("kind", kind))
            }
            (Stage::Fill, StagePayload::Artifact(artifact)) => {
                let filled = self.collaborators.filler.fill(unit, artifact).await?;
                let kind = filled.kind.clone();
                Ok(AttemptOutput::new(StagePayload::Artifact(filled)).with("kind", kind))
            }
            (Stage::Export, StagePayload::Artifact(artifact)) => {
                let location = self.collaborators.exporter.export(unit, artifact).await?;
                let mut output = AttemptOutput::new(StagePayload::Exported(location.clone()));
                output.artifact = Some(location);
                Ok(output)
            }
            (_, payload) => Err(PipelineError::FatalRun(format!(
                "{stage} stage received {} input",
                payload.describe()
            ))),
        }
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}
