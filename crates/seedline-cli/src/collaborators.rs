//! Reference collaborators used by the `run` command.

use std::path::PathBuf;

use async_trait::async_trait;
use seedline_core::{
    Artifact, Candidate, Collector, Exporter, Filler, PipelineError, Processor, Result, Stage,
    WorkUnitConfig,
};
use serde_json::{Map, Value, json};
use tokio::fs;

const DEFAULT_TOP: usize = 20;
const DEFAULT_TEMPLATE: &str = "{term}";

fn param<'unit>(unit: &'unit WorkUnitConfig, stage: Stage, key: &str) -> Option<&'unit Value> {
    unit.stage_params(stage).and_then(|params| params.get(key))
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::trim)
                .filter(|item| !item.is_empty())
                .map(str::to_owned)
                .collect()
        })
        .unwrap_or_default()
}

/// Expands `collect.seeds` with optional `collect.modifiers` into candidates.
///
/// Each seed is emitted as-is and once per modifier (`"<seed> <modifier>"`).
/// Candidates are scored so that shorter phrases rank higher.
pub struct SeedListCollector;

#[async_trait]
impl Collector for SeedListCollector {
    async fn collect(&self, unit: &WorkUnitConfig) -> Result<Vec<Candidate>> {
        let seeds = string_list(param(unit, Stage::Collect, "seeds"));
        if seeds.is_empty() {
            return Err(PipelineError::stage_failed(
                Stage::Collect,
                format!("work unit {} has no collect.seeds", unit.id),
            ));
        }
        let modifiers = string_list(param(unit, Stage::Collect, "modifiers"));
        let category = param(unit, Stage::Collect, "category")
            .and_then(Value::as_str)
            .unwrap_or(&unit.id)
            .to_owned();

        let mut candidates = Vec::with_capacity(seeds.len() * (modifiers.len() + 1));
        for seed in &seeds {
            candidates.push(scored(seed.clone(), &category));
            for modifier in &modifiers {
                candidates.push(scored(format!("{seed} {modifier}"), &category));
            }
        }

        tracing::debug!(
            "Collected {} candidates for {} from {} seeds",
            candidates.len(),
            unit.id,
            seeds.len()
        );
        Ok(candidates)
    }
}

fn scored(term: String, category: &str) -> Candidate {
    let words = term.split_whitespace().count().max(1);
    Candidate::new(term, category)
        .with_score(1.0 / words as f64)
        .with_metadata("source", json!("seed-list"))
}

/// Ranks approved candidates by score and keeps the top `process.top`.
pub struct ScoringProcessor;

#[async_trait]
impl Processor for ScoringProcessor {
    async fn process(&self, unit: &WorkUnitConfig, candidates: &[Candidate]) -> Result<Artifact> {
        let top = param(unit, Stage::Process, "top")
            .and_then(Value::as_u64)
            .map_or(DEFAULT_TOP, |top| usize::try_from(top).unwrap_or(usize::MAX));

        let mut ranked: Vec<&Candidate> = candidates.iter().collect();
        ranked.sort_by(|left, right| {
            right
                .score
                .unwrap_or(0.0)
                .total_cmp(&left.score.unwrap_or(0.0))
                .then_with(|| left.term.cmp(&right.term))
        });
        ranked.truncate(top);

        let entries: Vec<Value> = ranked
            .iter()
            .enumerate()
            .map(|(index, candidate)| {
                json!({
                    "rank": index + 1,
                    "term": candidate.term,
                    "category": candidate.category,
                    "score": candidate.score,
                })
            })
            .collect();
        Ok(Artifact::new("ranked", Value::Array(entries)))
    }
}

/// Renders `fill.template` for every ranked entry.
///
/// Supported placeholders are `{term}`, `{category}`, `{rank}` and `{unit}`.
pub struct TemplateFiller;

#[async_trait]
impl Filler for TemplateFiller {
    async fn fill(&self, unit: &WorkUnitConfig, artifact: &Artifact) -> Result<Artifact> {
        let template = param(unit, Stage::Fill, "template")
            .and_then(Value::as_str)
            .unwrap_or(DEFAULT_TEMPLATE);
        let entries = artifact.payload.as_array().ok_or_else(|| {
            PipelineError::stage_failed(
                Stage::Fill,
                format!("expected a ranked list, got {} artifact", artifact.kind),
            )
        })?;

        let lines: Vec<Value> = entries
            .iter()
            .map(|entry| Value::String(render(template, &unit.id, entry)))
            .collect();

        let mut payload = Map::new();
        payload.insert("unit".to_owned(), json!(unit.id));
        payload.insert("entries".to_owned(), artifact.payload.clone());
        payload.insert("lines".to_owned(), Value::Array(lines));
        Ok(Artifact::new("filled", Value::Object(payload)))
    }
}

fn render(template: &str, unit_id: &str, entry: &Value) -> String {
    let field = |key: &str| match entry.get(key) {
        Some(Value::String(text)) => text.clone(),
        Some(other) => other.to_string(),
        None => String::new(),
    };
    template
        .replace("{term}", &field("term"))
        .replace("{category}", &field("category"))
        .replace("{rank}", &field("rank"))
        .replace("{unit}", unit_id)
}

/// Writes each filled artifact to `<output_dir>/<unit>.json`.
pub struct JsonFileExporter {
    output_dir: PathBuf,
}

impl JsonFileExporter {
    /// Creates an exporter writing below `output_dir`.
    pub fn new(output_dir: PathBuf) -> Self {
        Self { output_dir }
    }
}

#[async_trait]
impl Exporter for JsonFileExporter {
    async fn export(&self, unit: &WorkUnitConfig, artifact: &Artifact) -> Result<String> {
        fs::create_dir_all(&self.output_dir).await?;
        let path = self.output_dir.join(format!("{}.json", unit.id));
        let contents = serde_json::to_vec_pretty(artifact)?;
        fs::write(&path, contents).await?;
        Ok(path.display().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::read_to_string;
    use tempfile::TempDir;

    fn unit() -> WorkUnitConfig {
        WorkUnitConfig::new("fitness")
            .with_stage_params(
                Stage::Collect,
                json!({ "seeds": ["kettlebell", " "], "modifiers": ["set", "for beginners"] }),
            )
            .with_stage_params(Stage::Process, json!({ "top": 2 }))
            .with_stage_params(Stage::Fill, json!({ "template": "{rank}. {term} ({unit})" }))
    }

    #[tokio::test]
    async fn test_reference_collaborators_chain() -> Result<()> {
        let unit = unit();

        let candidates = SeedListCollector.collect(&unit).await?;
        let terms: Vec<&str> = candidates.iter().map(|candidate| candidate.term.as_str()).collect();
        assert_eq!(terms, vec!["kettlebell", "kettlebell set", "kettlebell for beginners"]);
        assert_eq!(candidates[0].category, "fitness");

        let ranked = ScoringProcessor.process(&unit, &candidates).await?;
        let ranked_terms: Vec<&str> = ranked
            .payload
            .as_array()
            .map(|entries| entries.iter().filter_map(|entry| entry["term"].as_str()).collect())
            .unwrap_or_default();
        assert_eq!(ranked_terms, vec!["kettlebell", "kettlebell set"]);

        let filled = TemplateFiller.fill(&unit, &ranked).await?;
        assert_eq!(filled.payload["lines"][0], json!("1. kettlebell (fitness)"));

        let temp = TempDir::new()?;
        let exporter = JsonFileExporter::new(temp.path().join("out"));
        let location = exporter.export(&unit, &filled).await?;
        assert!(location.ends_with("fitness.json"));
        let written = read_to_string(&location)?;
        assert!(written.contains("kettlebell"));
        Ok(())
    }

    #[tokio::test]
    async fn test_collector_requires_seeds() {
        let failure = SeedListCollector.collect(&WorkUnitConfig::new("empty")).await.err();
        assert!(matches!(failure, Some(PipelineError::StageFailed { .. })));
    }
}
