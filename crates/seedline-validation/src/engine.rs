//! Consensus engine reconciling the verdicts of several validators.

use core::time::Duration;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use seedline_core::{
    Candidate, CandidateKey, ConsensusStrategy, PipelineError, ValidationConfig,
    dedupe_candidates,
};
use tokio::sync::{Mutex as AsyncMutex, Semaphore};
use tokio::task::{Id as TaskId, JoinSet};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::stats::EngineStatistics;
use crate::validator::Validator;

/// Record of one validator invocation inside a single `validate` call.
struct ValidatorRun {
    name: String,
    candidates_in: usize,
    /// Number of approved candidates, `None` when the validator failed
    approved: Option<usize>,
    elapsed: Duration,
}

/// Verdict of one validator: its run record plus the approved candidates.
type Verdict = (ValidatorRun, Option<Vec<Candidate>>);

/// Reconciles verdicts from an ordered set of validators.
///
/// Validators are sorted by ascending priority at construction and the list
/// never changes afterwards. Validator failures never escape
/// [`validate`](Self::validate): sequential chains stop and keep the
/// survivors so far, parallel and majority strategies treat the failing
/// validator as having approved nothing.
///
/// Overlapping `validate` calls on one engine run one after another, so a
/// validator is never entered by two calls at once. Each call still owns its
/// own worker pool.
pub struct ValidationConsensusEngine {
    validators: Vec<Arc<dyn Validator>>,
    call_lock: AsyncMutex<()>,
    max_workers: Option<usize>,
    validator_timeout: Option<Duration>,
    stats: Mutex<EngineStatistics>,
}

impl ValidationConsensusEngine {
    /// Creates an engine over `validators`, sorted by ascending priority.
    ///
    /// Validators sharing a priority keep their registration order.
    pub fn new(mut validators: Vec<Arc<dyn Validator>>) -> Self {
        validators.sort_by_key(|validator| validator.priority());
        Self {
            validators,
            call_lock: AsyncMutex::new(()),
            max_workers: None,
            validator_timeout: None,
            stats: Mutex::new(EngineStatistics::default()),
        }
    }

    /// Creates an engine using the worker cap and timeout from `config`.
    pub fn from_config(validators: Vec<Arc<dyn Validator>>, config: &ValidationConfig) -> Self {
        let engine = Self::new(validators);
        Self {
            max_workers: config.max_workers,
            validator_timeout: config.validator_timeout(),
            ..engine
        }
    }

    /// Caps the number of validators running at once in concurrent strategies.
    #[must_use]
    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = Some(max_workers);
        self
    }

    /// Treats validators that exceed `limit` as failed.
    #[must_use]
    pub fn with_validator_timeout(mut self, limit: Duration) -> Self {
        self.validator_timeout = Some(limit);
        self
    }

    /// Registered validators in priority order.
    pub fn validators(&self) -> &[Arc<dyn Validator>] {
        &self.validators
    }

    /// Number of validators currently enabled.
    pub fn enabled_count(&self) -> usize {
        self.validators
            .iter()
            .filter(|validator| validator.enabled())
            .count()
    }

    /// Returns the approved subset of `candidates` under `strategy`.
    ///
    /// The input is deduplicated by natural key and never mutated. With no
    /// enabled validators the deduplicated input is returned unchanged; an
    /// empty input returns empty without invoking any validator.
    pub async fn validate(
        &self,
        candidates: &[Candidate],
        strategy: ConsensusStrategy,
    ) -> Vec<Candidate> {
        let call = self.call_lock.lock().await;
        let approved = self.validate_exclusive(candidates, strategy).await;
        drop(call);
        approved
    }

    async fn validate_exclusive(
        &self,
        candidates: &[Candidate],
        strategy: ConsensusStrategy,
    ) -> Vec<Candidate> {
        let started = Instant::now();
        let input = dedupe_candidates(candidates.to_vec());
        let active: Vec<Arc<dyn Validator>> = self
            .validators
            .iter()
            .filter(|validator| validator.enabled())
            .map(Arc::clone)
            .collect();

        let mut runs = Vec::with_capacity(active.len());
        let approved = if input.is_empty() {
            Vec::new()
        } else if active.is_empty() {
            debug!("No enabled validators, passing {} candidates through", input.len());
            input.clone()
        } else {
            match strategy {
                ConsensusStrategy::Sequential => {
                    self.run_sequential(&active, input.clone(), &mut runs).await
                }
                ConsensusStrategy::Parallel => {
                    let verdicts = self.run_concurrent(&active, &input, &mut runs).await;
                    union_of(&input, &verdicts)
                }
                ConsensusStrategy::Majority => {
                    let verdicts = self.run_concurrent(&active, &input, &mut runs).await;
                    majority_of(&input, &verdicts, active.len())
                }
            }
        };

        debug!(
            "Consensus ({strategy}) approved {}/{} candidates with {} validators",
            approved.len(),
            input.len(),
            active.len()
        );
        self.record(strategy, input.len(), approved.len(), started.elapsed(), &runs);
        approved
    }

    /// Cascading filter chain: each validator sees only the previous survivors.
    async fn run_sequential(
        &self,
        active: &[Arc<dyn Validator>],
        input: Vec<Candidate>,
        runs: &mut Vec<ValidatorRun>,
    ) -> Vec<Candidate> {
        let mut survivors = input;

        for validator in active {
            if survivors.is_empty() {
                break;
            }

            let (run, approved) =
                invoke(validator.as_ref(), &survivors, self.validator_timeout).await;
            runs.push(run);

            if let Some(next) = approved {
                survivors = next;
            } else {
                // Fail open: keep what the chain approved so far.
                warn!(
                    "Validator {} failed, stopping sequential chain with {} survivors",
                    validator.name(),
                    survivors.len()
                );
                break;
            }
        }

        survivors
    }

    /// Runs every active validator against the full input on a worker pool
    /// scoped to this call. Returns verdicts in `active` order.
    async fn run_concurrent(
        &self,
        active: &[Arc<dyn Validator>],
        input: &[Candidate],
        runs: &mut Vec<ValidatorRun>,
    ) -> Vec<Option<Vec<Candidate>>> {
        let workers = self
            .max_workers
            .map_or(active.len(), |cap| cap.clamp(1, active.len()));
        let semaphore = Arc::new(Semaphore::new(workers));
        let shared: Arc<[Candidate]> = Arc::from(input);
        let limit = self.validator_timeout;

        let mut join_set = JoinSet::new();
        let mut task_slots: HashMap<TaskId, usize> = HashMap::with_capacity(active.len());

        for (index, validator) in active.iter().enumerate() {
            let validator = Arc::clone(validator);
            let candidates = Arc::clone(&shared);
            let semaphore = Arc::clone(&semaphore);

            let handle = join_set.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                invoke(validator.as_ref(), &candidates, limit).await
            });
            task_slots.insert(handle.id(), index);
        }

        let mut verdicts: Vec<Option<Vec<Candidate>>> = vec![None; active.len()];
        let mut slots: Vec<Option<ValidatorRun>> = active.iter().map(|_| None).collect();

        while let Some(joined) = join_set.join_next_with_id().await {
            match joined {
                Ok((id, (run, approved))) => {
                    if let Some(&index) = task_slots.get(&id) {
                        verdicts[index] = approved;
                        slots[index] = Some(run);
                    }
                }
                Err(error) => {
                    if let Some(&index) = task_slots.get(&error.id()) {
                        let name = active[index].name().to_owned();
                        warn!("Validator {name} aborted: {error}");
                        slots[index] = Some(ValidatorRun {
                            name,
                            candidates_in: input.len(),
                            approved: None,
                            elapsed: Duration::ZERO,
                        });
                    }
                }
            }
        }

        runs.extend(slots.into_iter().flatten());
        verdicts
    }

    /// Updates aggregate and per-validator statistics after a call.
    fn record(
        &self,
        strategy: ConsensusStrategy,
        processed: usize,
        approved: usize,
        elapsed: Duration,
        runs: &[ValidatorRun],
    ) {
        let Ok(mut guard) = self.stats.lock() else {
            return;
        };
        let stats = &mut *guard;

        stats.executions += 1;
        stats.candidates_processed += processed as u64;
        stats.candidates_approved += approved as u64;
        stats.total_duration_ms += elapsed.as_secs_f64() * 1000.0;
        *stats
            .by_strategy
            .entry(strategy.name().to_owned())
            .or_default() += 1;

        for run in runs {
            let entry = stats.validators.entry(run.name.clone()).or_default();
            if let Some(count) = run.approved {
                entry.record_success(run.candidates_in, count, run.elapsed);
            } else {
                entry.record_failure(run.candidates_in, run.elapsed);
                stats.validator_failures += 1;
            }
        }
    }

    /// Copy of the engine's aggregate and per-validator statistics.
    pub fn statistics(&self) -> EngineStatistics {
        self.stats
            .lock()
            .map(|stats| stats.clone())
            .unwrap_or_default()
    }

    /// Clears engine statistics and every registered validator's own
    /// statistics.
    pub fn reset_statistics(&self) {
        if let Ok(mut stats) = self.stats.lock() {
            *stats = EngineStatistics::default();
        }
        for validator in &self.validators {
            validator.reset_statistics();
        }
    }
}

/// Invokes one validator, applying the optional time budget and restricting
/// its output to deduplicated members of `candidates`.
async fn invoke(
    validator: &dyn Validator,
    candidates: &[Candidate],
    limit: Option<Duration>,
) -> Verdict {
    let started = Instant::now();
    let outcome = match limit {
        Some(limit) => timeout(limit, validator.validate(candidates))
            .await
            .unwrap_or_else(|_elapsed| {
                Err(PipelineError::validator(
                    validator.name(),
                    format!("timed out after {}ms", limit.as_millis()),
                ))
            }),
        None => validator.validate(candidates).await,
    };
    let elapsed = started.elapsed();

    let approved = match outcome {
        Ok(approved) => Some(restrict_to(approved, candidates)),
        Err(error) => {
            warn!("Absorbing validator failure: {error}");
            None
        }
    };

    let run = ValidatorRun {
        name: validator.name().to_owned(),
        candidates_in: candidates.len(),
        approved: approved.as_ref().map(Vec::len),
        elapsed,
    };
    (run, approved)
}

/// Drops approved entries that were not in the validator's input and
/// duplicate keys, so every validator casts at most one vote per candidate.
fn restrict_to(approved: Vec<Candidate>, input: &[Candidate]) -> Vec<Candidate> {
    let allowed: HashSet<CandidateKey> = input.iter().map(Candidate::key).collect();
    let mut seen = HashSet::with_capacity(approved.len());
    approved
        .into_iter()
        .filter(|candidate| {
            let key = candidate.key();
            allowed.contains(&key) && seen.insert(key)
        })
        .collect()
}

/// Candidates approved by at least one validator, in input order.
fn union_of(input: &[Candidate], verdicts: &[Option<Vec<Candidate>>]) -> Vec<Candidate> {
    let approved: HashSet<CandidateKey> = verdicts
        .iter()
        .flatten()
        .flatten()
        .map(Candidate::key)
        .collect();

    input
        .iter()
        .filter(|candidate| approved.contains(&candidate.key()))
        .cloned()
        .collect()
}

/// Candidates with `votes >= enabled / 2`, in input order.
///
/// The comparison is inclusive, so exactly half of an even validator count
/// approves. A failed validator casts no votes but still counts as enabled.
fn majority_of(
    input: &[Candidate],
    verdicts: &[Option<Vec<Candidate>>],
    enabled: usize,
) -> Vec<Candidate> {
    let threshold = enabled as f64 / 2.0;
    let mut votes: HashMap<CandidateKey, usize> = HashMap::new();
    for candidate in verdicts.iter().flatten().flatten() {
        *votes.entry(candidate.key()).or_default() += 1;
    }

    input
        .iter()
        .filter(|candidate| {
            votes
                .get(&candidate.key())
                .is_some_and(|&count| count as f64 >= threshold)
        })
        .cloned()
        .collect()
}
