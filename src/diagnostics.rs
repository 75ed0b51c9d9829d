//! Per-cluster skill error rates, computed over the response table in
//! fixed-size batches so it never has to fit in memory.
//!
//! Each batch is scored, collapsed, joined against the cluster assignment and
//! reduced to per-(cluster, subject, skill) partial counts before the next
//! batch is read. Only the running partials outlive a batch.

use std::collections::{BTreeMap, HashMap};
use std::io::Read;

use csv::ByteRecord;
use tracing::{debug, info};

use crate::config::AggregationMode;
use crate::error::Result;
use crate::features::COL_STUDENT_ID;
use crate::items::ItemMap;
use crate::models::{DiagnosticRow, GroupKey, ObservationKey};
use crate::results::COL_CLUSTER;
use crate::scoring::{ResponseRow, ScoreStats, Scorer};
use crate::table::{field, raw_field, TableReader};

/// Student id to cluster id, loaded once and read-only afterwards.
pub type ClusterAssignments = HashMap<String, String>;

/// Reads the student/cluster columns of a result table. A repeated student
/// keeps its first cluster.
pub fn load_clusters<R: Read>(reader: &mut TableReader<R>) -> Result<ClusterAssignments> {
    let id = reader.require(COL_STUDENT_ID)?;
    let cluster = reader.require(COL_CLUSTER)?;
    let mut assignments = ClusterAssignments::new();
    let mut record = ByteRecord::new();
    while reader.next_row(&mut record)? {
        if let (Some(student), Some(cluster)) = (field(&record, id), field(&record, cluster)) {
            assignments.entry(student).or_insert(cluster);
        }
    }
    info!(
        path = %reader.path().display(),
        students = assignments.len(),
        "cluster assignments loaded"
    );
    Ok(assignments)
}

/// Sequential fixed-size batches of a response table.
pub struct ResponseBatches<R> {
    reader: TableReader<R>,
    id: usize,
    columns: Vec<(String, usize)>,
    batch_size: usize,
    record: ByteRecord,
}

impl<R: Read> ResponseBatches<R> {
    /// Every response column the item map scores must be present.
    pub fn new(reader: TableReader<R>, items: &ItemMap, batch_size: usize) -> Result<Self> {
        let id = reader.require(COL_STUDENT_ID)?;
        let mut names: Vec<&str> = items.columns().collect();
        names.sort_unstable();
        let columns = names
            .into_iter()
            .map(|name| -> Result<(String, usize)> { Ok((name.to_string(), reader.require(name)?)) })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            reader,
            id,
            columns,
            batch_size: batch_size.max(1),
            record: ByteRecord::new(),
        })
    }

    pub fn next_batch(&mut self) -> Result<Option<Vec<ResponseRow>>> {
        let mut rows = Vec::with_capacity(self.batch_size.min(16_384));
        while rows.len() < self.batch_size && self.reader.next_row(&mut self.record)? {
            let responses = self
                .columns
                .iter()
                .filter_map(|(name, index)| {
                    let answers = raw_field(&self.record, *index);
                    (!answers.trim().is_empty()).then(|| (name.clone(), answers))
                })
                .collect();
            rows.push(ResponseRow {
                student_id: field(&self.record, self.id).unwrap_or_default(),
                responses,
            });
        }
        Ok((!rows.is_empty()).then_some(rows))
    }
}

/// Correct and attempted counts of one group within one batch.
#[derive(Debug, Clone, PartialEq)]
pub struct PartialAggregate {
    pub key: GroupKey,
    pub correct: usize,
    pub attempted: usize,
}

impl PartialAggregate {
    pub fn mean(&self) -> f64 {
        self.correct as f64 / self.attempted as f64
    }
}

/// Inner-joins collapsed observations with the cluster assignment and groups
/// them. Students without a cluster contribute nothing.
pub fn aggregate_batch(
    collapsed: &HashMap<ObservationKey, bool>,
    clusters: &ClusterAssignments,
) -> (Vec<PartialAggregate>, usize) {
    let mut groups: BTreeMap<GroupKey, (usize, usize)> = BTreeMap::new();
    let mut unmatched = 0usize;
    for (key, &correct) in collapsed {
        let Some(cluster) = clusters.get(&key.student_id) else {
            unmatched += 1;
            continue;
        };
        let entry = groups
            .entry(GroupKey {
                cluster: cluster.clone(),
                subject: key.subject,
                descriptor: key.descriptor.clone(),
            })
            .or_insert((0, 0));
        entry.0 += usize::from(correct);
        entry.1 += 1;
    }

    let partials = groups
        .into_iter()
        .map(|(key, (correct, attempted))| PartialAggregate {
            key,
            correct,
            attempted,
        })
        .collect();
    (partials, unmatched)
}

#[derive(Debug, Clone, Copy, Default)]
struct GroupTotals {
    correct: usize,
    attempted: usize,
    mean_sum: f64,
    batches: usize,
}

/// Running totals across batches. Carries both the pooled counts and the sum
/// of per-batch means so either combination can be emitted.
#[derive(Debug, Default)]
pub struct DiagnosticAccumulator {
    groups: BTreeMap<GroupKey, GroupTotals>,
    batches: usize,
}

impl DiagnosticAccumulator {
    pub fn absorb(&mut self, partials: Vec<PartialAggregate>) {
        if partials.is_empty() {
            return;
        }
        self.batches += 1;
        for partial in partials {
            let mean = partial.mean();
            let totals = self.groups.entry(partial.key).or_default();
            totals.correct += partial.correct;
            totals.attempted += partial.attempted;
            totals.mean_sum += mean;
            totals.batches += 1;
        }
    }

    pub fn batches(&self) -> usize {
        self.batches
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Error rate per group, ordered by cluster, subject and skill.
    pub fn finish(self, mode: AggregationMode) -> Vec<DiagnosticRow> {
        self.groups
            .into_iter()
            .map(|(key, totals)| {
                let accuracy = match mode {
                    AggregationMode::Pooled => totals.correct as f64 / totals.attempted as f64,
                    AggregationMode::MeanOfMeans => totals.mean_sum / totals.batches as f64,
                };
                DiagnosticRow {
                    cluster: key.cluster,
                    subject: key.subject,
                    descriptor: key.descriptor,
                    error_rate: 1.0 - accuracy,
                }
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DiagnosticOutcome {
    Table {
        rows: Vec<DiagnosticRow>,
        batches: usize,
        stats: ScoreStats,
    },
    /// No batch produced a joined observation.
    Empty { batches: usize },
}

/// Options for one aggregation pass.
#[derive(Debug, Clone, Copy)]
pub struct DiagnosticOptions<'a> {
    pub batch_size: usize,
    pub answer_letters: &'a str,
    pub mode: AggregationMode,
}

/// Streams `responses` batch by batch. Any read error aborts the whole pass;
/// a skipped batch would bias every group it touched.
pub fn run_diagnostics<R: Read>(
    items: &ItemMap,
    clusters: &ClusterAssignments,
    responses: TableReader<R>,
    options: DiagnosticOptions<'_>,
) -> Result<DiagnosticOutcome> {
    let scorer = Scorer::new(items, options.answer_letters);
    let mut batches = ResponseBatches::new(responses, items, options.batch_size)?;
    let mut accumulator = DiagnosticAccumulator::default();
    let mut stats = ScoreStats::default();
    let mut read = 0usize;

    while let Some(batch) = batches.next_batch()? {
        read += 1;
        let (collapsed, batch_stats) = scorer.score_batch(&batch);
        drop(batch);
        let (partials, unmatched) = aggregate_batch(&collapsed, clusters);
        debug!(
            batch = read,
            observations = collapsed.len(),
            groups = partials.len(),
            unmatched,
            unmapped_offsets = batch_stats.unmapped_offsets,
            unscorable_chars = batch_stats.unscorable_chars,
            "batch aggregated"
        );
        stats.absorb(batch_stats);
        accumulator.absorb(partials);
    }

    if accumulator.is_empty() {
        return Ok(DiagnosticOutcome::Empty { batches: read });
    }
    info!(
        batches = read,
        contributing = accumulator.batches(),
        scored = stats.scored,
        mode = ?options.mode,
        "diagnostic aggregation finished"
    );
    Ok(DiagnosticOutcome::Table {
        rows: accumulator.finish(options.mode),
        batches: read,
        stats,
    })
}
