//! Mock collaborators and validators shared by the orchestrator tests.
#![cfg_attr(
    test,
    allow(
        dead_code,
        clippy::expect_used,
        clippy::unwrap_used,
        clippy::panic,
        clippy::missing_panics_doc,
        clippy::missing_errors_doc,
        clippy::tests_outside_test_module,
        reason = "Test allows"
    )
)]

use core::time::Duration;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use seedline_core::{
    Artifact, Candidate, Collector, Exporter, Filler, PipelineConfig, PipelineError, Processor,
    Result, RetryConfig, Stage, WorkUnitConfig,
};
use seedline_pipeline::{Collaborators, PipelineOrchestrator};
use seedline_validation::{
    StatisticsCell, ValidationConsensusEngine, Validator, ValidatorStatistics,
};
use serde_json::{Value, json};
use tokio::sync::Semaphore;
use tokio::time::timeout;

/// Ordered record of which collaborator stage ran for which unit.
#[derive(Clone, Default)]
pub struct StageLog {
    entries: Arc<Mutex<Vec<(String, Stage)>>>,
}

impl StageLog {
    fn push(&self, unit: &WorkUnitConfig, stage: Stage) {
        self.entries.lock().unwrap().push((unit.id.clone(), stage));
    }

    /// Stages logged for `unit_id`, in call order (retries included).
    pub fn stages_for(&self, unit_id: &str) -> Vec<Stage> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .filter(|(unit, _)| unit == unit_id)
            .map(|(_, stage)| *stage)
            .collect()
    }

    /// Unit id of every logged call, in call order across all units.
    pub fn units_in_order(&self) -> Vec<String> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .map(|(unit, _)| unit.clone())
            .collect()
    }
}

fn params<'unit>(unit: &'unit WorkUnitConfig, stage: Stage, key: &str) -> Option<&'unit Value> {
    unit.stage_params(stage).and_then(|params| params.get(key))
}

fn scripted_failure(unit: &WorkUnitConfig, stage: Stage) -> Option<PipelineError> {
    match params(unit, stage, "fail").and_then(Value::as_str) {
        Some("permanent") => Some(PipelineError::stage_failed(stage, "scripted failure")),
        Some("fatal") => Some(PipelineError::FatalRun("scripted fatal".to_owned())),
        _ => None,
    }
}

/// Collector reading terms from the unit's `collect.terms` parameter.
///
/// Supports `gated` (blocks until the harness releases it),
/// `transient_failures` (fails that many attempts first) and `fail`.
struct MockCollector {
    log: StageLog,
    gate: Arc<Semaphore>,
    entered: Arc<Semaphore>,
    attempts: Mutex<HashMap<String, u64>>,
}

#[async_trait]
impl Collector for MockCollector {
    async fn collect(&self, unit: &WorkUnitConfig) -> Result<Vec<Candidate>> {
        self.log.push(unit, Stage::Collect);

        if params(unit, Stage::Collect, "gated").and_then(Value::as_bool) == Some(true) {
            self.entered.add_permits(1);
            self.gate.acquire().await.unwrap().forget();
        }

        let attempt = {
            let mut attempts = self.attempts.lock().unwrap();
            let count = attempts.entry(unit.id.clone()).or_default();
            *count += 1;
            *count
        };
        let transient = params(unit, Stage::Collect, "transient_failures")
            .and_then(Value::as_u64)
            .unwrap_or(0);
        if attempt <= transient {
            return Err(PipelineError::transient(Stage::Collect, "rate limited"));
        }
        if let Some(failure) = scripted_failure(unit, Stage::Collect) {
            return Err(failure);
        }

        let terms = params(unit, Stage::Collect, "terms")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        Ok(terms
            .iter()
            .filter_map(Value::as_str)
            .map(|term| Candidate::new(term, "niche"))
            .collect())
    }
}

struct MockProcessor {
    log: StageLog,
}

#[async_trait]
impl Processor for MockProcessor {
    async fn process(&self, unit: &WorkUnitConfig, candidates: &[Candidate]) -> Result<Artifact> {
        self.log.push(unit, Stage::Process);
        if let Some(failure) = scripted_failure(unit, Stage::Process) {
            return Err(failure);
        }
        let terms: Vec<&str> = candidates
            .iter()
            .map(|candidate| candidate.term.as_str())
            .collect();
        Ok(Artifact::new("terms", json!(terms)))
    }
}

struct MockFiller {
    log: StageLog,
}

#[async_trait]
impl Filler for MockFiller {
    async fn fill(&self, unit: &WorkUnitConfig, artifact: &Artifact) -> Result<Artifact> {
        self.log.push(unit, Stage::Fill);
        if let Some(failure) = scripted_failure(unit, Stage::Fill) {
            return Err(failure);
        }
        Ok(Artifact::new(
            "page",
            json!({ "title": unit.id, "terms": artifact.payload }),
        ))
    }
}

struct MockExporter {
    log: StageLog,
}

#[async_trait]
impl Exporter for MockExporter {
    async fn export(&self, unit: &WorkUnitConfig, _artifact: &Artifact) -> Result<String> {
        self.log.push(unit, Stage::Export);
        if let Some(failure) = scripted_failure(unit, Stage::Export) {
            return Err(failure);
        }
        Ok(format!("memory://{}", unit.id))
    }
}

/// Validator approving a fixed set of terms, or always failing.
pub struct TermValidator {
    name: String,
    priority: i32,
    approves: HashSet<String>,
    fails: bool,
    stats: StatisticsCell,
}

impl TermValidator {
    pub fn approving(name: &str, priority: i32, terms: &[&str]) -> Arc<dyn Validator> {
        Arc::new(Self {
            name: name.to_owned(),
            priority,
            approves: terms.iter().map(|term| (*term).to_owned()).collect(),
            fails: false,
            stats: StatisticsCell::default(),
        })
    }

    pub fn failing(name: &str, priority: i32) -> Arc<dyn Validator> {
        Arc::new(Self {
            name: name.to_owned(),
            priority,
            approves: HashSet::new(),
            fails: true,
            stats: StatisticsCell::default(),
        })
    }
}

#[async_trait]
impl Validator for TermValidator {
    fn name(&self) -> &str {
        &self.name
    }

    fn enabled(&self) -> bool {
        true
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    async fn validate(&self, candidates: &[Candidate]) -> Result<Vec<Candidate>> {
        if self.fails {
            self.stats.record_failure(candidates.len(), Duration::ZERO);
            return Err(PipelineError::validator(&self.name, "upstream unavailable"));
        }
        let approved: Vec<Candidate> = candidates
            .iter()
            .filter(|candidate| self.approves.contains(&candidate.term))
            .cloned()
            .collect();
        self.stats
            .record_success(candidates.len(), approved.len(), Duration::ZERO);
        Ok(approved)
    }

    fn statistics(&self) -> ValidatorStatistics {
        self.stats.snapshot()
    }

    fn reset_statistics(&self) {
        self.stats.reset();
    }
}

/// Controls for the mock collaborators of one orchestrator.
pub struct Harness {
    pub log: StageLog,
    gate: Arc<Semaphore>,
    entered: Arc<Semaphore>,
}

impl Harness {
    /// Waits until a gated collect call has been entered.
    pub async fn entered(&self) {
        timeout(Duration::from_secs(5), self.entered.acquire())
            .await
            .expect("gated collect was never entered")
            .unwrap()
            .forget();
    }

    /// Lets one gated collect call proceed.
    pub fn release(&self) {
        self.gate.add_permits(1);
    }
}

/// Work unit collecting `terms`.
pub fn unit(id: &str, terms: &[&str]) -> WorkUnitConfig {
    WorkUnitConfig::new(id).with_stage_params(Stage::Collect, json!({ "terms": terms }))
}

/// Work unit whose collect blocks until [`Harness::release`].
pub fn gated_unit(id: &str, terms: &[&str]) -> WorkUnitConfig {
    WorkUnitConfig::new(id)
        .with_stage_params(Stage::Collect, json!({ "terms": terms, "gated": true }))
}

/// Config with the given units and a fast retry policy.
pub fn config(units: Vec<WorkUnitConfig>) -> PipelineConfig {
    PipelineConfig {
        retry: RetryConfig {
            max_attempts: 3,
            backoff_ms: 1,
            stage_timeout_seconds: None,
        },
        work_units: units,
        ..PipelineConfig::default()
    }
}

/// Builds an orchestrator over mock collaborators.
pub fn orchestrator(
    config: &PipelineConfig,
    validators: Vec<Arc<dyn Validator>>,
) -> (PipelineOrchestrator, Harness) {
    let log = StageLog::default();
    let gate = Arc::new(Semaphore::new(0));
    let entered = Arc::new(Semaphore::new(0));

    let collaborators = Collaborators::new(
        Arc::new(MockCollector {
            log: log.clone(),
            gate: Arc::clone(&gate),
            entered: Arc::clone(&entered),
            attempts: Mutex::new(HashMap::new()),
        }),
        Arc::new(MockProcessor { log: log.clone() }),
        Arc::new(MockFiller { log: log.clone() }),
        Arc::new(MockExporter { log: log.clone() }),
    );
    let engine = Arc::new(ValidationConsensusEngine::from_config(
        validators,
        &config.validation,
    ));

    let orchestrator = PipelineOrchestrator::new(config, collaborators, engine)
        .expect("valid orchestrator config");
    (orchestrator, Harness { log, gate, entered })
}

/// Owned unit id list for `start`.
pub fn ids(unit_ids: &[&str]) -> Vec<String> {
    unit_ids.iter().map(|unit_id| (*unit_id).to_owned()).collect()
}
