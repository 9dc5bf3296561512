//! Running statistics for validators and the consensus engine.

use core::time::Duration;
use std::collections::BTreeMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

/// Running statistics for a single validator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidatorStatistics {
    /// Number of `validate` invocations
    pub calls: u64,
    /// Invocations that returned an error or timed out
    pub failures: u64,
    /// Candidates handed to the validator
    pub candidates_in: u64,
    /// Candidates the validator approved
    pub candidates_out: u64,
    /// Accumulated wall-clock time in milliseconds
    pub total_duration_ms: f64,
}

impl ValidatorStatistics {
    /// Records a successful invocation.
    pub fn record_success(&mut self, candidates_in: usize, candidates_out: usize, elapsed: Duration) {
        self.calls += 1;
        self.candidates_in += candidates_in as u64;
        self.candidates_out += candidates_out as u64;
        self.total_duration_ms += elapsed.as_secs_f64() * 1000.0;
    }

    /// Records a failed invocation. Failed calls approve nothing.
    pub fn record_failure(&mut self, candidates_in: usize, elapsed: Duration) {
        self.calls += 1;
        self.failures += 1;
        self.candidates_in += candidates_in as u64;
        self.total_duration_ms += elapsed.as_secs_f64() * 1000.0;
    }

    /// Fraction of received candidates that were approved.
    pub fn approval_rate(&self) -> f64 {
        if self.candidates_in == 0 {
            0.0
        } else {
            self.candidates_out as f64 / self.candidates_in as f64
        }
    }

    /// Mean duration per call in milliseconds.
    pub fn average_duration_ms(&self) -> f64 {
        if self.calls == 0 {
            0.0
        } else {
            self.total_duration_ms / self.calls as f64
        }
    }
}

/// Thread-safe holder that validator implementations embed to keep their own
/// statistics.
#[derive(Debug, Default)]
pub struct StatisticsCell {
    inner: Mutex<ValidatorStatistics>,
}

impl StatisticsCell {
    /// Records a successful invocation.
    pub fn record_success(&self, candidates_in: usize, candidates_out: usize, elapsed: Duration) {
        if let Ok(mut stats) = self.inner.lock() {
            stats.record_success(candidates_in, candidates_out, elapsed);
        }
    }

    /// Records a failed invocation.
    pub fn record_failure(&self, candidates_in: usize, elapsed: Duration) {
        if let Ok(mut stats) = self.inner.lock() {
            stats.record_failure(candidates_in, elapsed);
        }
    }

    /// Copy of the current statistics.
    pub fn snapshot(&self) -> ValidatorStatistics {
        self.inner
            .lock()
            .map(|stats| stats.clone())
            .unwrap_or_default()
    }

    /// Clears all counters.
    pub fn reset(&self) {
        if let Ok(mut stats) = self.inner.lock() {
            *stats = ValidatorStatistics::default();
        }
    }
}

/// Aggregate statistics maintained by the consensus engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineStatistics {
    /// Number of `validate` calls
    pub executions: u64,
    /// Candidates received across all calls (after deduplication)
    pub candidates_processed: u64,
    /// Candidates approved across all calls
    pub candidates_approved: u64,
    /// Accumulated wall-clock time in milliseconds
    pub total_duration_ms: f64,
    /// Validator invocations that failed and were absorbed
    pub validator_failures: u64,
    /// Calls per strategy name
    pub by_strategy: BTreeMap<String, u64>,
    /// Per-validator statistics as observed by the engine
    pub validators: BTreeMap<String, ValidatorStatistics>,
}

impl EngineStatistics {
    /// Mean duration per call in milliseconds.
    pub fn average_duration_ms(&self) -> f64 {
        if self.executions == 0 {
            0.0
        } else {
            self.total_duration_ms / self.executions as f64
        }
    }

    /// Fraction of processed candidates that were approved.
    pub fn approval_rate(&self) -> f64 {
        if self.candidates_processed == 0 {
            0.0
        } else {
            self.candidates_approved as f64 / self.candidates_processed as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validator_statistics_rates() {
        let mut stats = ValidatorStatistics::default();
        assert!(stats.approval_rate().abs() < f64::EPSILON);
        assert!(stats.average_duration_ms().abs() < f64::EPSILON);

        stats.record_success(4, 1, Duration::from_millis(10));
        stats.record_failure(4, Duration::from_millis(30));

        assert_eq!(stats.calls, 2);
        assert_eq!(stats.failures, 1);
        assert_eq!(stats.candidates_in, 8);
        assert_eq!(stats.candidates_out, 1);
        assert!((stats.approval_rate() - 0.125).abs() < f64::EPSILON);
        assert!((stats.average_duration_ms() - 20.0).abs() < 1e-6);
    }

    #[test]
    fn test_statistics_cell_reset() {
        let cell = StatisticsCell::default();
        cell.record_success(3, 2, Duration::from_millis(1));
        assert_eq!(cell.snapshot().candidates_out, 2);

        cell.reset();
        assert_eq!(cell.snapshot(), ValidatorStatistics::default());
    }

    #[test]
    fn test_engine_statistics_rates() {
        let stats = EngineStatistics {
            executions: 4,
            candidates_processed: 10,
            candidates_approved: 4,
            total_duration_ms: 8.0,
            ..EngineStatistics::default()
        };
        assert!((stats.approval_rate() - 0.4).abs() < f64::EPSILON);
        assert!((stats.average_duration_ms() - 2.0).abs() < f64::EPSILON);
    }
}
