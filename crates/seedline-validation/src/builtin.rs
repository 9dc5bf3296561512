//! Reference validators that can be declared in configuration.
//!
//! Each validator is a [`RuleValidator`] wrapping a per-candidate
//! [`CandidateRule`]. Rules are pure predicates; the wrapper supplies the
//! name, priority, enabled flag and statistics.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use regex::Regex;
use seedline_core::{Candidate, PipelineError, Result, ValidatorKind, ValidatorSpec};

use crate::stats::{StatisticsCell, ValidatorStatistics};
use crate::validator::Validator;

/// Per-candidate approval predicate.
pub trait CandidateRule: Send + Sync {
    /// Whether `candidate` passes this rule.
    fn accepts(&self, candidate: &Candidate) -> bool;
}

/// Validator that approves every candidate its rule accepts.
pub struct RuleValidator<R> {
    name: String,
    priority: i32,
    enabled: bool,
    rule: R,
    stats: StatisticsCell,
}

impl<R: CandidateRule> RuleValidator<R> {
    /// Wraps `rule` as an enabled validator.
    pub fn new(name: impl Into<String>, priority: i32, rule: R) -> Self {
        Self {
            name: name.into(),
            priority,
            enabled: true,
            rule,
            stats: StatisticsCell::default(),
        }
    }

    /// Sets whether this validator takes part in consensus.
    #[must_use]
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// The wrapped rule.
    pub fn rule(&self) -> &R {
        &self.rule
    }
}

#[async_trait]
impl<R: CandidateRule> Validator for RuleValidator<R> {
    fn name(&self) -> &str {
        &self.name
    }

    fn enabled(&self) -> bool {
        self.enabled
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    async fn validate(&self, candidates: &[Candidate]) -> Result<Vec<Candidate>> {
        let started = Instant::now();
        let approved: Vec<Candidate> = candidates
            .iter()
            .filter(|candidate| self.rule.accepts(candidate))
            .cloned()
            .collect();
        self.stats
            .record_success(candidates.len(), approved.len(), started.elapsed());
        Ok(approved)
    }

    fn statistics(&self) -> ValidatorStatistics {
        self.stats.snapshot()
    }

    fn reset_statistics(&self) {
        self.stats.reset();
    }
}

/// Accepts terms whose character count lies within inclusive bounds.
#[derive(Debug, Clone, Copy)]
pub struct LengthRule {
    min: usize,
    max: usize,
}

impl LengthRule {
    /// Creates a rule accepting `min..=max` characters.
    pub const fn new(min: usize, max: usize) -> Self {
        Self { min, max }
    }
}

impl CandidateRule for LengthRule {
    fn accepts(&self, candidate: &Candidate) -> bool {
        let length = candidate.term.trim().chars().count();
        length >= self.min && length <= self.max
    }
}

/// Rejects terms containing any blocked word, matched case-insensitively as a
/// whole token. Words may start or end with symbols (`c++`, `.net`).
#[derive(Debug, Clone)]
pub struct BlocklistRule {
    pattern: Option<Regex>,
}

impl BlocklistRule {
    /// Compiles a rule from blocked words. An empty list blocks nothing.
    ///
    /// # Errors
    /// Returns a configuration error if the combined pattern fails to compile.
    pub fn new<S: AsRef<str>>(words: &[S]) -> Result<Self> {
        let alternatives: Vec<String> = words
            .iter()
            .map(|word| word.as_ref().trim())
            .filter(|word| !word.is_empty())
            .map(regex::escape)
            .collect();

        if alternatives.is_empty() {
            return Ok(Self { pattern: None });
        }

        // Word boundaries never match next to a symbol, so delimit on non-word
        // characters instead.
        let source = format!(r"(?i)(?:^|\W)(?:{})(?:$|\W)", alternatives.join("|"));
        let pattern = Regex::new(&source).map_err(|error| {
            PipelineError::Configuration(format!("invalid blocklist pattern: {error}"))
        })?;
        Ok(Self {
            pattern: Some(pattern),
        })
    }
}

impl CandidateRule for BlocklistRule {
    fn accepts(&self, candidate: &Candidate) -> bool {
        self.pattern
            .as_ref()
            .is_none_or(|pattern| !pattern.is_match(&candidate.term))
    }
}

/// Accepts candidates whose category is in an allow list.
#[derive(Debug, Clone)]
pub struct CategoryRule {
    allowed: HashSet<String>,
}

impl CategoryRule {
    /// Creates a rule allowing the given categories (case-insensitive).
    pub fn new<S: AsRef<str>>(categories: &[S]) -> Self {
        Self {
            allowed: categories
                .iter()
                .map(|category| category.as_ref().trim().to_lowercase())
                .collect(),
        }
    }
}

impl CandidateRule for CategoryRule {
    fn accepts(&self, candidate: &Candidate) -> bool {
        self.allowed
            .contains(&candidate.category.trim().to_lowercase())
    }
}

/// Accepts scored candidates at or above a threshold. Unscored candidates
/// are rejected.
#[derive(Debug, Clone, Copy)]
pub struct ScoreRule {
    min_score: f64,
}

impl ScoreRule {
    /// Creates a rule with the given inclusive threshold.
    pub const fn new(min_score: f64) -> Self {
        Self { min_score }
    }
}

impl CandidateRule for ScoreRule {
    fn accepts(&self, candidate: &Candidate) -> bool {
        candidate.score.is_some_and(|score| score >= self.min_score)
    }
}

/// Term length validator.
pub type LengthValidator = RuleValidator<LengthRule>;
/// Word blocklist validator.
pub type BlocklistValidator = RuleValidator<BlocklistRule>;
/// Category allow-list validator.
pub type CategoryValidator = RuleValidator<CategoryRule>;
/// Minimum score validator.
pub type ScoreValidator = RuleValidator<ScoreRule>;

/// Builds the reference validators declared in configuration.
///
/// # Errors
/// Returns a configuration error when a declaration is missing a required
/// field or its parameters are inconsistent.
pub fn build_validators(specs: &[ValidatorSpec]) -> Result<Vec<Arc<dyn Validator>>> {
    specs.iter().map(build_validator).collect()
}

fn build_validator(spec: &ValidatorSpec) -> Result<Arc<dyn Validator>> {
    let validator: Arc<dyn Validator> = match spec.kind {
        ValidatorKind::Length => {
            let min = spec.min_length.unwrap_or(1);
            let max = spec.max_length.unwrap_or(usize::MAX);
            if min > max {
                return Err(PipelineError::Configuration(format!(
                    "validator {}: min_length {min} exceeds max_length {max}",
                    spec.name
                )));
            }
            Arc::new(
                LengthValidator::new(&spec.name, spec.priority, LengthRule::new(min, max))
                    .with_enabled(spec.enabled),
            )
        }
        ValidatorKind::Blocklist => Arc::new(
            BlocklistValidator::new(&spec.name, spec.priority, BlocklistRule::new(&spec.words)?)
                .with_enabled(spec.enabled),
        ),
        ValidatorKind::Category => {
            if spec.categories.is_empty() {
                return Err(PipelineError::Configuration(format!(
                    "validator {}: categories must not be empty",
                    spec.name
                )));
            }
            Arc::new(
                CategoryValidator::new(
                    &spec.name,
                    spec.priority,
                    CategoryRule::new(&spec.categories),
                )
                .with_enabled(spec.enabled),
            )
        }
        ValidatorKind::Score => {
            let min_score = spec.min_score.ok_or_else(|| {
                PipelineError::Configuration(format!(
                    "validator {}: min_score is required",
                    spec.name
                ))
            })?;
            Arc::new(
                ScoreValidator::new(&spec.name, spec.priority, ScoreRule::new(min_score))
                    .with_enabled(spec.enabled),
            )
        }
    };

    tracing::debug!(
        "Built {:?} validator {} (priority {}, enabled {})",
        spec.kind,
        spec.name,
        spec.priority,
        spec.enabled
    );
    Ok(validator)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn terms(candidates: &[Candidate]) -> Vec<&str> {
        candidates
            .iter()
            .map(|candidate| candidate.term.as_str())
            .collect()
    }

    #[test]
    fn test_length_rule_bounds_are_inclusive() {
        let rule = LengthRule::new(3, 5);
        assert!(!rule.accepts(&Candidate::new("ab", "x")));
        assert!(rule.accepts(&Candidate::new("abc", "x")));
        assert!(rule.accepts(&Candidate::new(" abcde ", "x")));
        assert!(!rule.accepts(&Candidate::new("abcdef", "x")));
    }

    #[test]
    fn test_blocklist_matches_whole_words_case_insensitively() -> Result<()> {
        let rule = BlocklistRule::new(&["casino", "c++"])?;
        assert!(!rule.accepts(&Candidate::new("Online CASINO bonus", "x")));
        assert!(rule.accepts(&Candidate::new("casinos nearby", "x")));
        assert!(rule.accepts(&Candidate::new("garden tools", "x")));
        Ok(())
    }

    #[test]
    fn test_blocklist_matches_words_with_symbols() -> Result<()> {
        let rule = BlocklistRule::new(&["c++", ".net", "$deal"])?;
        assert!(!rule.accepts(&Candidate::new("learn c++ fast", "x")));
        assert!(!rule.accepts(&Candidate::new("C++", "x")));
        assert!(!rule.accepts(&Candidate::new("hosting for .NET apps", "x")));
        assert!(!rule.accepts(&Candidate::new("today's $deal", "x")));
        assert!(rule.accepts(&Candidate::new("abc++ parser", "x")));
        assert!(rule.accepts(&Candidate::new("asp.net core", "x")));
        Ok(())
    }

    #[test]
    fn test_empty_blocklist_blocks_nothing() -> Result<()> {
        let empty = BlocklistRule::new::<&str>(&[])?;
        assert!(empty.accepts(&Candidate::new("anything", "x")));
        Ok(())
    }

    #[test]
    fn test_category_and_score_rules() {
        let category = CategoryRule::new(&["Fitness"]);
        assert!(category.accepts(&Candidate::new("yoga", "fitness")));
        assert!(!category.accepts(&Candidate::new("yoga", "travel")));

        let score = ScoreRule::new(0.5);
        assert!(score.accepts(&Candidate::new("a", "x").with_score(0.5)));
        assert!(!score.accepts(&Candidate::new("a", "x").with_score(0.49)));
        assert!(!score.accepts(&Candidate::new("a", "x")));
    }

    #[tokio::test]
    async fn test_rule_validator_records_statistics() -> Result<()> {
        let validator = LengthValidator::new("length", 1, LengthRule::new(2, 10));
        let approved = validator
            .validate(&[Candidate::new("ok", "x"), Candidate::new("a", "x")])
            .await?;
        assert_eq!(terms(&approved), vec!["ok"]);

        let stats = validator.statistics();
        assert_eq!(stats.calls, 1);
        assert_eq!(stats.candidates_in, 2);
        assert_eq!(stats.candidates_out, 1);

        validator.reset_statistics();
        assert_eq!(validator.statistics().calls, 0);
        Ok(())
    }

    #[test]
    fn test_build_validators_from_specs() -> Result<()> {
        let mut blocklist = ValidatorSpec::new("blocked", ValidatorKind::Blocklist, 2);
        blocklist.words = vec!["spam".to_owned()];
        blocklist.enabled = false;
        let mut score = ValidatorSpec::new("score", ValidatorKind::Score, 3);
        score.min_score = Some(0.2);

        let validators = build_validators(&[
            ValidatorSpec::new("length", ValidatorKind::Length, 1),
            blocklist,
            score,
        ])?;

        assert_eq!(validators.len(), 3);
        assert_eq!(validators[0].name(), "length");
        assert!(!validators[1].enabled());
        assert_eq!(validators[2].priority(), 3);
        assert_eq!(validators[2].statistics().calls, 0);
        Ok(())
    }

    #[test]
    fn test_build_validators_rejects_incomplete_specs() {
        let score = ValidatorSpec::new("score", ValidatorKind::Score, 1);
        assert!(matches!(
            build_validators(&[score]).err(),
            Some(PipelineError::Configuration(_))
        ));

        let category = ValidatorSpec::new("category", ValidatorKind::Category, 1);
        assert!(build_validators(&[category]).is_err());

        let mut length = ValidatorSpec::new("length", ValidatorKind::Length, 1);
        length.min_length = Some(10);
        length.max_length = Some(2);
        assert!(build_validators(&[length]).is_err());
    }
}
