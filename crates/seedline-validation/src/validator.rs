use async_trait::async_trait;
use seedline_core::{Candidate, Result};

use crate::stats::ValidatorStatistics;

/// Pluggable capability that approves a subset of candidates.
///
/// Implementations are registered with the
/// [`ValidationConsensusEngine`](crate::ValidationConsensusEngine), which
/// decides how their verdicts are combined.
#[async_trait]
pub trait Validator: Send + Sync {
    /// Unique, human-readable name of this validator.
    fn name(&self) -> &str;

    /// Whether this validator currently takes part in consensus.
    fn enabled(&self) -> bool;

    /// Position in sequential chains; lower values run first.
    fn priority(&self) -> i32;

    /// Returns the approved subset of `candidates`.
    ///
    /// # Errors
    /// Returns an error if the validator malfunctions. The engine absorbs the
    /// error according to the active strategy.
    async fn validate(&self, candidates: &[Candidate]) -> Result<Vec<Candidate>>;

    /// Statistics this validator keeps about itself.
    fn statistics(&self) -> ValidatorStatistics;

    /// Clears this validator's statistics.
    fn reset_statistics(&self);
}
