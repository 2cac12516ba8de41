//! ffbatch - batch media jobs on top of ffmpeg
//!
//! Entry point of the command line tool. Each invocation feeds files into a
//! job's pending batch; once the batch is complete the external tool runs and
//! the result is written to the output directory.

use anyhow::{Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn, Level};
use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use ffbatch::batch::JobKey;
use ffbatch::cli::{Args, Commands, InputArgs, JobArgs};
use ffbatch::config::Config;
use ffbatch::job::{IncomingItem, JobOptions, JobOutcome, JobOutput, JobRequest, Operation, Orchestrator};
use ffbatch::media::TokioProcessExecutor;

const DEFAULT_CONFIG_FILE: &str = "ffbatch.toml";

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    setup_logging(args.verbose)?;

    if let Commands::InitConfig { output, force } = &args.command {
        if output.exists() && !*force {
            anyhow::bail!("{} already exists, pass --force to overwrite", output.display());
        }
        Config::default().save_to_file(output)?;
        println!("Wrote default configuration to {}", output.display());
        return Ok(());
    }

    let config = load_config(args.config.as_deref())?;
    let orchestrator = Orchestrator::from_config(config)?;

    match args.command {
        Commands::Merge { job, inputs, min_files, overrides } => {
            let options = job_options(&job, min_files, overrides.to_overrides());
            run_job(&orchestrator, &job, &inputs, Operation::Merge, options).await?;
        }
        Commands::Overlay { job, inputs, text, overrides } => {
            let mode = text.mode(&orchestrator.config().overlay.text);
            let options = job_options(&job, None, overrides.to_overrides());
            run_job(&orchestrator, &job, &inputs, Operation::Overlay(mode), options).await?;
        }
        Commands::Custom { job, inputs, overrides } => {
            let options = job_options(&job, None, overrides.to_overrides());
            run_job(&orchestrator, &job, &inputs, Operation::Custom, options).await?;
        }
        Commands::Info { inputs } => {
            let items = load_items(&inputs).await?;
            let request = JobRequest {
                key: JobKey::new("info"),
                operation: Operation::Info,
                items,
                options: JobOptions::default(),
            };
            let outcome = orchestrator.execute(request).await?;
            report(outcome, Path::new(".")).await?;
        }
        Commands::Pending { job, operation } => {
            let pending = orchestrator
                .pending(&JobKey::new(job), &operation.operation())
                .await?;
            if pending.is_empty() {
                println!("No pending files.");
            } else {
                for path in pending {
                    println!("{}", path.display());
                }
            }
        }
        Commands::Reset { job, operation } => {
            let removed = orchestrator
                .reset(&JobKey::new(job.clone()), &operation.operation())
                .await?;
            println!("Removed {} pending files from job {}", removed, job);
        }
        // written before the configuration is loaded
        Commands::InitConfig { .. } => {}
    }

    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    let config = match path {
        Some(config_path) => Config::from_file(config_path)?,
        None => {
            if Path::new(DEFAULT_CONFIG_FILE).exists() {
                info!("Found {} in current directory, loading...", DEFAULT_CONFIG_FILE);
                Config::from_file(DEFAULT_CONFIG_FILE)?
            } else {
                Config::default()
            }
        }
    };
    Ok(config)
}

fn job_options(
    job: &JobArgs,
    threshold: Option<usize>,
    overrides: Option<ffbatch::media::Overrides>,
) -> JobOptions {
    JobOptions {
        template: job.template.clone(),
        threshold,
        overrides,
        output_file_name: job.output_name.clone(),
    }
}

async fn load_items(inputs: &InputArgs) -> Result<Vec<IncomingItem>> {
    let mut items = Vec::new();
    for path in inputs.collect()? {
        items.push(IncomingItem::from_path(&path).await?);
    }
    Ok(items)
}

async fn run_job(
    orchestrator: &Orchestrator,
    job: &JobArgs,
    inputs: &InputArgs,
    operation: Operation,
    options: JobOptions,
) -> Result<()> {
    let binary = &orchestrator.config().media.binary_path;
    if let Err(e) = TokioProcessExecutor::new().check_availability(binary).await {
        warn!("{} is not usable, batches can still accumulate: {}", binary, e);
    }

    let items = load_items(inputs).await?;
    info!("Loaded {} input files for job {}", items.len(), job.job);

    let spinner = ProgressBar::new_spinner();
    spinner.set_style(ProgressStyle::default_spinner().template("{spinner:.green} [{elapsed_precise}] {msg}")?);
    spinner.set_message(format!("Running {}...", operation.name()));
    spinner.enable_steady_tick(Duration::from_millis(120));

    let request = JobRequest {
        key: JobKey::new(job.job.clone()),
        operation,
        items,
        options,
    };
    let outcome = orchestrator.execute(request).await;
    spinner.finish_and_clear();

    report(outcome?, &job.output_dir).await
}

/// Write produced files to `output_dir` and print one JSON record per output
async fn report(outcome: JobOutcome, output_dir: &Path) -> Result<()> {
    match outcome {
        JobOutcome::StillAccumulating { pending, threshold } => {
            let status = json!({ "status": "accumulating", "pending": pending, "threshold": threshold });
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        JobOutcome::Completed(outputs) => {
            for output in outputs {
                match output {
                    JobOutput::Artifact { record, artifact } => {
                        let path = write_artifact(output_dir, &artifact.file_name, &artifact.bytes).await?;
                        let mut rendered = serde_json::to_value(&record)?;
                        rendered["path"] = json!(path.display().to_string());
                        rendered["mimeType"] = json!(artifact.mime_type);
                        println!("{}", serde_json::to_string_pretty(&rendered)?);
                    }
                    JobOutput::Info(info) => {
                        println!("{}", serde_json::to_string_pretty(&info)?);
                    }
                }
            }
        }
    }
    Ok(())
}

async fn write_artifact(output_dir: &Path, file_name: &str, bytes: &[u8]) -> Result<PathBuf> {
    tokio::fs::create_dir_all(output_dir)
        .await
        .with_context(|| format!("Failed to create {}", output_dir.display()))?;
    let path = output_dir.join(file_name);
    tokio::fs::write(&path, bytes)
        .await
        .with_context(|| format!("Failed to write {}", path.display()))?;
    info!("Wrote {} ({} bytes)", path.display(), bytes.len());
    Ok(path)
}

/// Setup logging to both console and file
fn setup_logging(verbose: bool) -> Result<()> {
    let log_dir = std::env::current_dir()?.join(".ffbatch").join("log");
    std::fs::create_dir_all(&log_dir)?;

    // Set up file appender with daily rotation
    let file_appender = rolling::daily(&log_dir, "ffbatch.log");
    let (non_blocking_file, guard) = non_blocking(file_appender);
    // Keep the guard alive for the duration of the program
    std::mem::forget(guard);

    let log_level = if verbose { Level::DEBUG } else { Level::INFO };

    // Console output goes to stderr so stdout stays machine readable
    let console_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    let file_layer = fmt::layer()
        .with_writer(non_blocking_file)
        .with_target(false)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env().add_directive(log_level.into()))
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    info!(
        "Logging initialized - console: {}, file: {}",
        log_level,
        log_dir.join("ffbatch.log").display()
    );

    Ok(())
}
