//! Per-grade stages wired together.
//!
//! A `GradeContext` carries the immutable configuration for one grade; each
//! stage takes it plus the data the previous stage produced, and nothing is
//! shared between grades.

use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use tracing::{debug, error, info, info_span, warn};
use uuid::Uuid;

use crate::anomaly::IsolationForest;
use crate::cluster::KMeans;
use crate::config::{AggregationMode, GradeConfig, PipelineConfig};
use crate::diagnostics::{load_clusters, run_diagnostics, DiagnosticOptions, DiagnosticOutcome};
use crate::error::{PipelineError, Result};
use crate::features::{load_students, standardize};
use crate::indicators::{learning_risk, summarize_by_school};
use crate::items::{ItemFilter, ItemMap};
use crate::models::{StudentRecord, StudentResult};
use crate::report::{build_report, load_skill_descriptions, ReportInput, SkillDescriptions};
use crate::results::{
    read_diagnostics, read_results, write_diagnostics, write_results, write_school_summary,
};
use crate::risk::{classify, RiskInput};
use crate::table::{TableReader, TableWriter};

#[derive(Debug, Clone, Copy)]
pub struct GradeContext<'a> {
    pub grade: &'a str,
    pub pipeline: &'a PipelineConfig,
    pub config: &'a GradeConfig,
}

impl<'a> GradeContext<'a> {
    pub fn new(pipeline: &'a PipelineConfig, grade: &'a str) -> Result<Self> {
        Ok(Self {
            grade,
            pipeline,
            config: pipeline.grade(grade)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClassifySummary {
    pub students: usize,
    pub outliers: usize,
    pub at_risk: usize,
    pub results: PathBuf,
}

/// Clusters, scores and labels already-cleaned students. Both models are fit
/// from scratch on exactly these students.
pub fn classify_students(ctx: GradeContext<'_>, students: Vec<StudentRecord>) -> Result<Vec<StudentResult>> {
    let k = ctx.config.n_clusters;
    if students.len() < k {
        return Err(PipelineError::InsufficientData {
            grade: ctx.grade.to_string(),
            students: students.len(),
            clusters: k,
        });
    }

    let (features, _) = standardize(&students);
    let clusters = KMeans::new(k, ctx.pipeline.seed).fit(&features);
    let anomalies = IsolationForest::new(ctx.pipeline.contamination, ctx.pipeline.seed)
        .fit_predict(&features);
    let learning = learning_risk(&students);
    info!(
        grade = ctx.grade,
        k,
        inertia = clusters.inertia,
        outliers = anomalies.outliers(),
        score_threshold = anomalies.threshold,
        "models fitted"
    );
    debug!(
        centroids = ?clusters.centroids,
        max_score = anomalies.scores.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        "model details"
    );

    let results = students
        .into_iter()
        .zip(clusters.cluster_ids())
        .zip(anomalies.flags)
        .zip(learning)
        .map(|(((student, cluster), anomaly), learning_risk)| {
            let label = classify(
                &RiskInput {
                    cluster: &cluster,
                    anomaly,
                    exceptional: &student.exceptional,
                },
                &ctx.config.risk,
                &ctx.pipeline.exceptional_yes,
            );
            StudentResult {
                student,
                cluster,
                anomaly,
                label,
                learning_risk,
            }
        })
        .collect();
    Ok(results)
}

/// Reads the grade's student table and writes the result table and the
/// per-school summary.
pub fn classify_grade(ctx: GradeContext<'_>) -> Result<ClassifySummary> {
    let mut reader = TableReader::open(&ctx.config.students)?;
    let (students, _) = load_students(&mut reader, &ctx.pipeline.exceptional_default)?;
    let results = classify_students(ctx, students)?;

    let mut writer = TableWriter::create(&ctx.config.results)?;
    write_results(&mut writer, &results)?;
    writer.finish()?;

    let mut writer = TableWriter::create(&ctx.config.school_report)?;
    write_school_summary(&mut writer, &summarize_by_school(&results))?;
    writer.finish()?;

    Ok(ClassifySummary {
        students: results.len(),
        outliers: results.iter().filter(|r| r.anomaly.is_outlier()).count(),
        at_risk: results.iter().filter(|r| r.label.is_at_risk()).count(),
        results: ctx.config.results.clone(),
    })
}

pub fn item_filter(pipeline: &PipelineConfig) -> Result<ItemFilter> {
    Ok(ItemFilter {
        descriptor: pipeline.descriptor_regex()?,
        excluded_answers: pipeline.excluded_answers.clone(),
    })
}

/// Builds the item map, loads the cluster assignment written by
/// `classify_grade`, and streams the grade's responses. Writes the diagnostic
/// table unless no observation joined.
pub fn diagnose_grade(
    ctx: GradeContext<'_>,
    batch_size: usize,
    mode: AggregationMode,
) -> Result<DiagnosticOutcome> {
    let pipeline = ctx.pipeline;
    let items = ItemMap::load(&mut TableReader::open(&pipeline.items)?, &item_filter(pipeline)?)?;
    let clusters = load_clusters(&mut TableReader::open(&ctx.config.results)?)?;
    let responses = TableReader::open(&ctx.config.students)?;

    let outcome = run_diagnostics(
        &items,
        &clusters,
        responses,
        DiagnosticOptions {
            batch_size,
            answer_letters: &pipeline.answer_letters,
            mode,
        },
    )?;

    match &outcome {
        DiagnosticOutcome::Table { rows, .. } => {
            let mut writer = TableWriter::create(&ctx.config.diagnostics)?;
            write_diagnostics(&mut writer, rows)?;
            writer.finish()?;
        }
        DiagnosticOutcome::Empty { batches } => {
            warn!(
                grade = ctx.grade,
                batches, "no response joined a cluster; diagnostic table not written"
            );
            remove_stale(&ctx.config.diagnostics)?;
        }
    }
    Ok(outcome)
}

/// A table left by an earlier fit is keyed by cluster ids that no longer mean
/// the same thing.
fn remove_stale(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => {
            info!(path = %path.display(), "stale diagnostic table removed");
            Ok(())
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(PipelineError::io(path, err)),
    }
}

/// Renders the markdown report from the tables on disk. The diagnostic table
/// and the skill matrix are optional.
pub fn report_grade(ctx: GradeContext<'_>, run_id: Uuid, generated_at: DateTime<Utc>) -> Result<PathBuf> {
    let results = read_results(&mut TableReader::open(&ctx.config.results)?)?;

    let diagnostics = if ctx.config.diagnostics.exists() {
        Some(read_diagnostics(&mut TableReader::open(&ctx.config.diagnostics)?)?)
    } else {
        None
    };
    let descriptions = match &ctx.config.skill_matrix {
        Some(path) => load_skill_descriptions(&mut TableReader::open(path)?)?,
        None => SkillDescriptions::new(),
    };

    let report = build_report(&ReportInput {
        grade: ctx.grade,
        run_id,
        generated_at,
        config: ctx.config,
        results: &results,
        diagnostics: diagnostics.as_deref(),
        descriptions: &descriptions,
    });
    let path = &ctx.config.report;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|err| PipelineError::io(parent, err))?;
    }
    std::fs::write(path, report).map_err(|err| PipelineError::io(path, err))?;
    Ok(ctx.config.report.clone())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Classify,
    Diagnose,
    Report,
}

#[derive(Debug, Clone, Copy)]
pub struct RunOptions {
    pub run_id: Uuid,
    pub batch_size: usize,
    pub mode: AggregationMode,
}

fn run_stage(ctx: GradeContext<'_>, stage: Stage, options: RunOptions) -> anyhow::Result<()> {
    match stage {
        Stage::Classify => {
            let summary = classify_grade(ctx)
                .with_context(|| format!("classification failed for {}", ctx.grade))?;
            println!(
                "{}: classified {} students ({} at risk, {} outliers) into {}.",
                ctx.grade,
                summary.students,
                summary.at_risk,
                summary.outliers,
                summary.results.display()
            );
        }
        Stage::Diagnose => {
            let outcome = diagnose_grade(ctx, options.batch_size, options.mode)
                .with_context(|| format!("skill diagnosis failed for {}", ctx.grade))?;
            match outcome {
                DiagnosticOutcome::Table {
                    rows,
                    batches,
                    stats,
                } => println!(
                    "{}: {} skill rows from {} batches ({} answers scored, {} skipped) written to {}.",
                    ctx.grade,
                    rows.len(),
                    batches,
                    stats.scored,
                    stats.unmapped_offsets + stats.unscorable_chars,
                    ctx.config.diagnostics.display()
                ),
                DiagnosticOutcome::Empty { batches } => println!(
                    "{}: no responses matched a classified student across {} batches.",
                    ctx.grade, batches
                ),
            }
        }
        Stage::Report => {
            let path = report_grade(ctx, options.run_id, Utc::now())
                .with_context(|| format!("report failed for {}", ctx.grade))?;
            println!("{}: report written to {}.", ctx.grade, path.display());
        }
    }
    Ok(())
}

/// Runs `stages` for every grade in turn. A failing grade is logged and the
/// next one still runs; the grades that failed are returned.
pub fn run_grades(
    config: &PipelineConfig,
    grades: &[String],
    stages: &[Stage],
    options: RunOptions,
) -> Vec<String> {
    let mut failed = Vec::new();
    for grade in grades {
        let span = info_span!("grade", run = %options.run_id, grade = %grade);
        let _guard = span.enter();

        let outcome = GradeContext::new(config, grade)
            .map_err(anyhow::Error::from)
            .and_then(|ctx| {
                stages
                    .iter()
                    .try_for_each(|&stage| run_stage(ctx, stage, options))
            });
        if let Err(err) = outcome {
            error!("{err:#}");
            failed.push(grade.clone());
        }
    }
    failed
}
