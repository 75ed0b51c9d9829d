use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

mod anomaly;
mod cluster;
mod config;
mod diagnostics;
mod error;
mod features;
mod indicators;
mod items;
mod models;
mod pipeline;
mod report;
mod results;
mod risk;
mod scoring;
mod table;
mod text;

use config::{AggregationMode, PipelineConfig};
use pipeline::{run_grades, RunOptions, Stage};

#[derive(Parser)]
#[command(name = "saeb-early-warning")]
#[command(about = "Learning-risk classification and skill diagnostics for SAEB grades", long_about = None)]
struct Cli {
    /// Pipeline configuration (JSON). Defaults to the reference deployment.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write the default configuration to a file
    InitConfig {
        #[arg(long, default_value = "pipeline.json")]
        out: PathBuf,
    },
    /// Cluster, score and label students
    Classify {
        #[arg(long)]
        grade: Option<String>,
    },
    /// Compute per-cluster skill error rates from response strings
    Diagnose {
        #[arg(long)]
        grade: Option<String>,
        #[arg(long)]
        batch_size: Option<usize>,
        #[arg(long, value_enum)]
        aggregation: Option<AggregationMode>,
    },
    /// Generate a markdown report from the result tables
    Report {
        #[arg(long)]
        grade: Option<String>,
    },
    /// Classify, diagnose and report in one go
    Run {
        #[arg(long)]
        grade: Option<String>,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = PipelineConfig::resolve(cli.config.as_deref()).with_context(|| {
        match &cli.config {
            Some(path) => format!("failed to load configuration {}", path.display()),
            None => "default configuration is invalid".to_string(),
        }
    })?;

    let (grade, stages, batch_size, mode) = match cli.command {
        Commands::InitConfig { out } => {
            config.save(&out)?;
            println!("Configuration written to {}.", out.display());
            return Ok(());
        }
        Commands::Classify { grade } => (grade, vec![Stage::Classify], None, None),
        Commands::Diagnose {
            grade,
            batch_size,
            aggregation,
        } => (grade, vec![Stage::Diagnose], batch_size, aggregation),
        Commands::Report { grade } => (grade, vec![Stage::Report], None, None),
        Commands::Run { grade } => (
            grade,
            vec![Stage::Classify, Stage::Diagnose, Stage::Report],
            None,
            None,
        ),
    };
    let batch_size = batch_size.unwrap_or(config.batch_size);
    if batch_size == 0 {
        anyhow::bail!("--batch-size must be positive");
    }
    let mode = mode.unwrap_or(config.aggregation);

    let run_id = Uuid::new_v4();
    let options = RunOptions {
        run_id,
        batch_size,
        mode,
    };
    let grades = config.selected_grades(grade.as_deref());
    let failed = run_grades(&config, &grades, &stages, options);

    if !failed.is_empty() {
        anyhow::bail!("run {run_id} failed for {}", failed.join(", "));
    }
    Ok(())
}
