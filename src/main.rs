use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::level_filters::LevelFilter;

use teamcheck::batch::run_batch_file;
use teamcheck::cli::{Cli, Commands, TeamCommands, TelemetryCommands, command_label};
use teamcheck::config::{
    RuntimeConfig, build_team_blueprint, load_profiles, load_team_file, resolve_runtime_config,
};
use teamcheck::error::{categorize_error, format_cli_error};
use teamcheck::evaluate::{DEFAULT_EVAL_OUTPUT_PATH, run_evaluation};
use teamcheck::model::{ChatModel, ScriptedModel};
use teamcheck::provider::{provider_label, resolve_models};
use teamcheck::team::TeamBlueprint;
use teamcheck::telemetry::{TelemetrySink, run_telemetry_report};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    if let Err(err) = run_cli(cli).await {
        eprintln!("{}", format_cli_error(&err));
        tracing::error!(category = %categorize_error(&err).code(), error = %err, "command failed");
        std::process::exit(1);
    }

    Ok(())
}

async fn run_cli(cli: Cli) -> Result<()> {
    init_tracing(&cli.log_filter)?;
    let profiles = load_profiles(&cli.config_path)?;
    let cfg = resolve_runtime_config(&cli, &profiles)?;
    let telemetry = TelemetrySink::new(
        cfg.telemetry_enabled,
        &cfg.telemetry_path,
        command_label(&cli.command),
    );

    match cli.command {
        Commands::Run {
            instruction,
            transcript,
        } => {
            let blueprint = build_blueprint(&cfg)?;
            let instruction = instruction.join(" ");
            let result = blueprint
                .run_task(&instruction, &telemetry)
                .await
                .context("conversation graph failed")?;

            if transcript {
                let roster = blueprint.roster();
                for message in &result.report.transcript {
                    println!(
                        "[{} -> {}] {}",
                        roster.display_sender(message.sender),
                        roster.display_receiver(message.receiver),
                        message.content
                    );
                }
                println!("---");
            }
            println!(
                "outcome={} steps={}",
                result.report.outcome.label(),
                result.report.steps
            );
            println!(
                "{}",
                serde_json::to_string_pretty(&result.answer)
                    .context("failed to serialize task answer")?
            );
        }
        Commands::Batch {
            dataset,
            output,
            failures,
            concurrency,
        } => {
            let blueprint = Arc::new(build_blueprint(&cfg)?);
            let results_path = PathBuf::from(&output);
            let failures_path = failures
                .map(PathBuf::from)
                .unwrap_or_else(|| default_failures_path(&results_path));
            run_batch_file(
                blueprint,
                Path::new(&dataset),
                &results_path,
                &failures_path,
                concurrency.unwrap_or(cfg.concurrency),
                &telemetry,
            )
            .await?;
        }
        Commands::Evaluate {
            results,
            golden,
            output,
            fail_under,
        } => {
            let output = output.unwrap_or_else(|| DEFAULT_EVAL_OUTPUT_PATH.to_string());
            run_evaluation(
                Path::new(&results),
                Path::new(&golden),
                Path::new(&output),
                fail_under,
                &telemetry,
            )?;
        }
        Commands::Team { command } => match command {
            TeamCommands::Show => {
                let team = load_team_file(&cfg.team_path)?;
                let blueprint = build_team_blueprint(
                    &cfg,
                    &team,
                    Arc::new(ScriptedModel::new("offline")),
                    None,
                )?;
                println!("Team file: {}", cfg.team_path);
                print!("{}", blueprint.describe());
            }
        },
        Commands::Telemetry { command } => match command {
            TelemetryCommands::Report { path, limit } => {
                let path = path.unwrap_or_else(|| cfg.telemetry_path.clone());
                run_telemetry_report(PathBuf::from(path), limit)?;
            }
        },
    }

    Ok(())
}

fn build_blueprint(cfg: &RuntimeConfig) -> Result<TeamBlueprint> {
    let team = load_team_file(&cfg.team_path)?;
    let models = resolve_models(cfg)?;
    tracing::info!(
        provider = provider_label(models.provider),
        model = models.agent.name(),
        formatter = models.formatter.name(),
        "Using model"
    );
    build_team_blueprint(cfg, &team, models.agent, Some(models.formatter))
}

fn default_failures_path(results_path: &Path) -> PathBuf {
    let stem = results_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "results".to_string());
    results_path.with_file_name(format!("{stem}.failures.json"))
}

fn init_tracing(log_filter: &str) -> Result<()> {
    let level = log_filter
        .parse::<LevelFilter>()
        .unwrap_or(LevelFilter::INFO);
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_env_filter(log_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing subscriber: {e}"))
}
