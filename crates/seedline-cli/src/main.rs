//! Seedline CLI - runs the seed-to-candidate pipeline from a TOML config
#![cfg_attr(
    test,
    allow(
        dead_code,
        clippy::expect_used,
        clippy::unwrap_used,
        clippy::panic,
        clippy::missing_panics_doc,
        clippy::missing_errors_doc,
        clippy::print_stdout,
        clippy::print_stderr,
        reason = "Allow for tests"
    )
)]

use core::time::Duration;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Result, bail};
use clap::Parser as _;
use seedline_core::{
    Candidate, PipelineConfig, RunState, Stage, ValidatorKind, ValidatorSpec, WorkUnitConfig,
};
use seedline_pipeline::{Collaborators, PipelineOrchestrator, RunStatus};
use seedline_validation::{ConsensusStrategy, ValidationConsensusEngine, build_validators};
use serde_json::json;
use tokio::signal::ctrl_c;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt as _, util::SubscriberInitExt as _};

mod cli;
mod collaborators;

use cli::{Cli, Commands};
use collaborators::{JsonFileExporter, ScoringProcessor, SeedListCollector, TemplateFiller};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "seedline=info".into()))
        .with(fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init { force } => handle_init(cli.config, force)?,
        Commands::Run {
            units,
            run_id,
            output,
            progress_interval_ms,
        } => {
            handle_run(
                cli.config.as_deref(),
                units,
                run_id,
                output,
                progress_interval_ms,
            )
            .await?;
        }
        Commands::Validate {
            terms,
            category,
            strategy,
        } => {
            handle_validate(cli.config.as_deref(), &terms, &category, strategy).await?;
        }
    }

    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<PipelineConfig> {
    let config = match path {
        Some(path) => PipelineConfig::load_from_file(path)?,
        None => PipelineConfig::load_or_create()?,
    };
    Ok(config)
}

fn build_engine(config: &PipelineConfig) -> Result<ValidationConsensusEngine> {
    let validators = build_validators(&config.validators)?;
    Ok(ValidationConsensusEngine::from_config(
        validators,
        &config.validation,
    ))
}

/// Starter configuration written by `seedline init`.
fn sample_config() -> PipelineConfig {
    let mut length = ValidatorSpec::new("length", ValidatorKind::Length, 10);
    length.min_length = Some(3);
    length.max_length = Some(60);

    let mut blocklist = ValidatorSpec::new("blocklist", ValidatorKind::Blocklist, 20);
    blocklist.words = vec!["free".to_owned(), "cheap".to_owned()];

    let mut score = ValidatorSpec::new("score", ValidatorKind::Score, 30);
    score.min_score = Some(0.3);

    let unit = WorkUnitConfig::new("home-fitness")
        .with_stage_params(
            Stage::Collect,
            json!({
                "seeds": ["kettlebell", "resistance bands", "yoga mat"],
                "modifiers": ["workout", "for beginners"],
            }),
        )
        .with_stage_params(Stage::Process, json!({ "top": 10 }))
        .with_stage_params(
            Stage::Fill,
            json!({ "template": "{rank}. {term} ({category})" }),
        );

    PipelineConfig {
        validators: vec![length, blocklist, score],
        work_units: vec![unit],
        ..PipelineConfig::default()
    }
}

fn handle_init(path: Option<PathBuf>, force: bool) -> Result<()> {
    let path = match path {
        Some(path) => path,
        None => PipelineConfig::config_path()?,
    };
    if path.exists() && !force {
        bail!(
            "{} already exists, pass --force to overwrite it",
            path.display()
        );
    }

    sample_config().save_to_file(&path)?;
    info!("Wrote starter config to {}", path.display());
    Ok(())
}

async fn handle_run(
    config_path: Option<&Path>,
    units: Vec<String>,
    run_id: Option<String>,
    output: PathBuf,
    progress_interval_ms: u64,
) -> Result<()> {
    let config = load_config(config_path)?;
    let engine = Arc::new(build_engine(&config)?);
    let collaborators = Collaborators::new(
        Arc::new(SeedListCollector),
        Arc::new(ScoringProcessor),
        Arc::new(TemplateFiller),
        Arc::new(JsonFileExporter::new(output)),
    );
    let orchestrator = PipelineOrchestrator::new(&config, collaborators, engine)?;

    let unit_ids = if units.is_empty() {
        config
            .work_units
            .iter()
            .map(|unit| unit.id.clone())
            .collect()
    } else {
        units
    };
    let run_id = orchestrator.start(&unit_ids, run_id)?;
    info!("Press Ctrl-C to cancel run {run_id}");

    let mut ticker = interval(Duration::from_millis(progress_interval_ms.max(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker.tick().await;

    let wait = orchestrator.wait();
    tokio::pin!(wait);
    let mut cancel_requested = false;

    let final_status = loop {
        tokio::select! {
            finished = &mut wait => break finished?,
            _ = ticker.tick() => log_progress(&orchestrator.status()),
            signal = ctrl_c(), if !cancel_requested => {
                cancel_requested = true;
                if let Err(err) = signal {
                    warn!("Could not listen for Ctrl-C: {err}");
                } else if let Err(err) = orchestrator.cancel() {
                    warn!("Cancel rejected: {err}");
                } else {
                    info!("Cancelling run {run_id}, waiting for in-flight stages");
                }
            }
        }
    };

    #[allow(clippy::print_stdout, reason = "Final run report")]
    {
        println!("{}", serde_json::to_string_pretty(&final_status)?);
    }

    if final_status.state == Some(RunState::Failed) {
        let reason = final_status
            .last_error
            .map_or_else(|| "no unit completed".to_owned(), |record| record.message);
        bail!("run {run_id} failed: {reason}");
    }
    Ok(())
}

fn log_progress(status: &RunStatus) {
    let state = status.state.map_or("idle", RunState::name);
    match (&status.current_unit, status.current_stage) {
        (Some(unit), Some(stage)) => info!(
            "[{state}] {:.0}% - {unit} / {stage}",
            status.progress_percent
        ),
        _ => info!("[{state}] {:.0}%", status.progress_percent),
    }
}

async fn handle_validate(
    config_path: Option<&Path>,
    terms: &[String],
    category: &str,
    strategy: Option<ConsensusStrategy>,
) -> Result<()> {
    let config = load_config(config_path)?;
    let engine = build_engine(&config)?;
    let strategy = strategy.unwrap_or(config.validation.strategy);

    let candidates: Vec<Candidate> = terms
        .iter()
        .map(|term| Candidate::new(term.as_str(), category))
        .collect();
    let approved = engine.validate(&candidates, strategy).await;
    info!(
        "{} of {} terms approved by {} validators ({strategy})",
        approved.len(),
        candidates.len(),
        engine.enabled_count()
    );

    let report = json!({
        "strategy": strategy,
        "approved": approved,
        "statistics": engine.statistics(),
    });

    #[allow(clippy::print_stdout, reason = "Validation report")]
    {
        println!("{}", serde_json::to_string_pretty(&report)?);
    }
    Ok(())
}
