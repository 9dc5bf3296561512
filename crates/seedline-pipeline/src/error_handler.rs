//! Classification, retry decisions and bounded history for stage failures.

use core::time::Duration;
use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use seedline_core::{ErrorClass, PipelineError, RetryConfig, Stage};
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

/// Where a failure happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorContext {
    /// Run the failure belongs to
    pub run_id: String,
    /// Unit being processed, if any
    pub unit_id: Option<String>,
    /// Stage being executed, if any
    pub stage: Option<Stage>,
    /// Attempt number (1-based) that failed
    pub attempt: u32,
}

impl ErrorContext {
    /// Context for a failure outside any unit.
    pub fn run(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            unit_id: None,
            stage: None,
            attempt: 1,
        }
    }

    /// Context for a failed stage attempt.
    pub fn stage(
        run_id: impl Into<String>,
        unit_id: impl Into<String>,
        stage: Stage,
        attempt: u32,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            unit_id: Some(unit_id.into()),
            stage: Some(stage),
            attempt,
        }
    }
}

/// One recorded failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    /// Classification assigned by the handler
    pub class: ErrorClass,
    /// Run the failure belongs to
    pub run_id: String,
    /// Unit being processed, if any
    pub unit_id: Option<String>,
    /// Stage being executed, if any
    pub stage: Option<Stage>,
    /// Attempt number that failed
    pub attempt: u32,
    /// Rendered error message
    pub message: String,
    /// When the failure was recorded
    pub timestamp: DateTime<Utc>,
}

/// What the stage runner should do after a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Retry the same stage after `delay`
    Retry {
        /// Backoff before the next attempt
        delay: Duration,
    },
    /// Mark the unit failed and move to the next unit
    FailUnit,
    /// Abort the whole run
    AbortRun,
}

/// Classifies stage failures and keeps a capped history of them.
///
/// The oldest record is evicted first once `history_limit` is reached.
#[derive(Debug)]
pub struct ErrorHandler {
    retry: RetryConfig,
    history_limit: usize,
    history: Mutex<VecDeque<ErrorRecord>>,
}

impl ErrorHandler {
    /// Creates a handler with the given retry policy and history cap.
    pub fn new(retry: RetryConfig, history_limit: usize) -> Self {
        Self {
            retry,
            history_limit,
            history: Mutex::new(VecDeque::with_capacity(history_limit.min(64))),
        }
    }

    /// Retry policy in use.
    pub fn retry_policy(&self) -> &RetryConfig {
        &self.retry
    }

    /// Classifies an error.
    pub fn classify(error: &PipelineError) -> ErrorClass {
        error.class()
    }

    /// Records `failure` and decides how to proceed.
    ///
    /// Transient failures are retried with linear backoff until the attempt
    /// budget is spent. Fatal failures abort the run; everything else fails
    /// the unit.
    pub fn handle(&self, context: &ErrorContext, failure: &PipelineError) -> ErrorAction {
        let class = Self::classify(failure);
        self.record(context, class, failure);

        let unit = context.unit_id.as_deref().unwrap_or("-");
        let stage = context
            .stage
            .map_or("-", Stage::name);

        match class {
            ErrorClass::Transient if context.attempt < self.retry.max_attempts => {
                let delay = self.retry.backoff(context.attempt);
                warn!(
                    "Attempt {}/{} of {stage} for unit {unit} failed, retrying in {}ms: {failure}",
                    context.attempt,
                    self.retry.max_attempts,
                    delay.as_millis()
                );
                ErrorAction::Retry { delay }
            }
            ErrorClass::Transient | ErrorClass::Permanent | ErrorClass::ValidatorInternal => {
                error!("Unit {unit} failed at {stage}: {failure}");
                ErrorAction::FailUnit
            }
            ErrorClass::Fatal => {
                error!("Run {} aborted at {stage} of unit {unit}: {failure}", context.run_id);
                ErrorAction::AbortRun
            }
        }
    }

    fn record(&self, context: &ErrorContext, class: ErrorClass, failure: &PipelineError) {
        if self.history_limit == 0 {
            return;
        }

        let record = ErrorRecord {
            class,
            run_id: context.run_id.clone(),
            unit_id: context.unit_id.clone(),
            stage: context.stage,
            attempt: context.attempt,
            message: failure.to_string(),
            timestamp: Utc::now(),
        };

        if let Ok(mut history) = self.history.lock() {
            history.push_back(record);
            while history.len() > self.history_limit {
                history.pop_front();
            }
        }
    }

    /// All retained records, oldest first.
    pub fn history(&self) -> Vec<ErrorRecord> {
        self.history
            .lock()
            .map(|history| history.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Up to `limit` most recent records, oldest first.
    pub fn recent(&self, limit: usize) -> Vec<ErrorRecord> {
        self.history
            .lock()
            .map(|history| {
                let skip = history.len().saturating_sub(limit);
                history.iter().skip(skip).cloned().collect()
            })
            .unwrap_or_default()
    }

    /// Most recent record, if any.
    pub fn last(&self) -> Option<ErrorRecord> {
        self.history
            .lock()
            .ok()
            .and_then(|history| history.back().cloned())
    }

    /// Most recent record belonging to `run_id`, if any.
    pub fn last_for_run(&self, run_id: &str) -> Option<ErrorRecord> {
        self.history.lock().ok().and_then(|history| {
            history
                .iter()
                .rev()
                .find(|record| record.run_id == run_id)
                .cloned()
        })
    }

    /// Number of retained records.
    pub fn len(&self) -> usize {
        self.history.lock().map_or(0, |history| history.len())
    }

    /// Whether no records are retained.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops every retained record.
    pub fn clear(&self) {
        if let Ok(mut history) = self.history.lock() {
            history.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handler(max_attempts: u32, history_limit: usize) -> ErrorHandler {
        ErrorHandler::new(
            RetryConfig {
                max_attempts,
                backoff_ms: 100,
                stage_timeout_seconds: None,
            },
            history_limit,
        )
    }

    #[test]
    fn test_transient_retries_with_linear_backoff_then_fails_unit() {
        let handler = handler(3, 10);
        let failure = PipelineError::transient(Stage::Collect, "rate limited");

        let first = handler.handle(&ErrorContext::stage("run", "unit", Stage::Collect, 1), &failure);
        let second = handler.handle(&ErrorContext::stage("run", "unit", Stage::Collect, 2), &failure);
        let third = handler.handle(&ErrorContext::stage("run", "unit", Stage::Collect, 3), &failure);

        assert_eq!(first, ErrorAction::Retry { delay: Duration::from_millis(100) });
        assert_eq!(second, ErrorAction::Retry { delay: Duration::from_millis(200) });
        assert_eq!(third, ErrorAction::FailUnit);
        assert_eq!(handler.len(), 3);
    }

    #[test]
    fn test_permanent_and_fatal_actions() {
        let handler = handler(3, 10);
        let context = ErrorContext::stage("run", "unit", Stage::Fill, 1);

        assert_eq!(
            handler.handle(&context, &PipelineError::stage_failed(Stage::Fill, "bad")),
            ErrorAction::FailUnit
        );
        assert_eq!(
            handler.handle(&context, &PipelineError::FatalRun("broken".to_owned())),
            ErrorAction::AbortRun
        );

        let last = handler.last();
        assert_eq!(last.as_ref().map(|record| record.class), Some(ErrorClass::Fatal));
        assert_eq!(last.and_then(|record| record.stage), Some(Stage::Fill));
    }

    #[test]
    fn test_history_evicts_oldest_first() {
        let handler = handler(1, 2);
        for attempt in 1..=3 {
            handler.handle(
                &ErrorContext::stage("run", format!("unit-{attempt}"), Stage::Export, 1),
                &PipelineError::stage_failed(Stage::Export, "disk full"),
            );
        }

        let units: Vec<Option<String>> = handler
            .history()
            .into_iter()
            .map(|record| record.unit_id)
            .collect();
        assert_eq!(units, vec![Some("unit-2".to_owned()), Some("unit-3".to_owned())]);

        assert_eq!(handler.recent(1).len(), 1);
        assert_eq!(handler.recent(10).len(), 2);

        handler.clear();
        assert!(handler.is_empty());
        assert!(handler.last().is_none());
    }

    #[test]
    fn test_zero_limit_keeps_nothing() {
        let handler = handler(3, 0);
        let action = handler.handle(
            &ErrorContext::run("run"),
            &PipelineError::Configuration("missing".to_owned()),
        );
        assert_eq!(action, ErrorAction::AbortRun);
        assert!(handler.is_empty());
    }
}
