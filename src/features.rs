use std::collections::HashSet;
use std::io::Read;

use csv::ByteRecord;
use tracing::info;

use crate::error::Result;
use crate::models::{FeatureVector, StudentRecord, FEATURE_COUNT};
use crate::table::{field, number_field, TableReader};

pub const COL_STUDENT_ID: &str = "ID_ALUNO";
pub const COL_SCHOOL_ID: &str = "ID_ESCOLA";
pub const COL_REGION_ID: &str = "ID_UF";
pub const COL_LP: &str = "PROFICIENCIA_LP";
pub const COL_MT: &str = "PROFICIENCIA_MT";
pub const COL_DISABILITY: &str = "TX_RESP_Q05a";
pub const COL_EXCEPTIONAL: &str = "TX_RESP_Q05c";

/// Counts of what cleaning removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleaningStats {
    pub rows_read: usize,
    pub missing_score: usize,
    pub duplicates: usize,
}

/// Loads and cleans a student table: rows without both proficiency scores are
/// dropped, repeated student ids keep their first occurrence, and a missing
/// exceptional-ability answer becomes `exceptional_default`.
pub fn load_students<R: Read>(
    reader: &mut TableReader<R>,
    exceptional_default: &str,
) -> Result<(Vec<StudentRecord>, CleaningStats)> {
    let id = reader.require(COL_STUDENT_ID)?;
    let school = reader.require(COL_SCHOOL_ID)?;
    let region = reader.require(COL_REGION_ID)?;
    let lp = reader.require(COL_LP)?;
    let mt = reader.require(COL_MT)?;
    let exceptional = reader.require(COL_EXCEPTIONAL)?;
    let disability = reader.column(COL_DISABILITY);

    let mut stats = CleaningStats::default();
    let mut seen = HashSet::new();
    let mut students = Vec::new();
    let mut record = ByteRecord::new();

    while reader.next_row(&mut record)? {
        stats.rows_read += 1;
        let (Some(score_lp), Some(score_mt)) = (number_field(&record, lp), number_field(&record, mt))
        else {
            stats.missing_score += 1;
            continue;
        };
        let student_id = field(&record, id).unwrap_or_default();
        if !seen.insert(student_id.clone()) {
            stats.duplicates += 1;
            continue;
        }

        students.push(StudentRecord {
            student_id,
            school_id: field(&record, school).unwrap_or_default(),
            region_id: field(&record, region).unwrap_or_default(),
            proficiency_lp: score_lp,
            proficiency_mt: score_mt,
            disability: disability.and_then(|index| field(&record, index)),
            exceptional: field(&record, exceptional)
                .unwrap_or_else(|| exceptional_default.to_string()),
            discrepancy: score_lp - score_mt,
        });
    }

    info!(
        path = %reader.path().display(),
        rows = stats.rows_read,
        kept = students.len(),
        missing_score = stats.missing_score,
        duplicates = stats.duplicates,
        "student table cleaned"
    );
    Ok((students, stats))
}

pub fn raw_features(student: &StudentRecord) -> FeatureVector {
    [
        student.proficiency_lp,
        student.proficiency_mt,
        student.discrepancy,
    ]
}

/// Per-feature mean and population standard deviation of one grade.
#[derive(Debug, Clone, PartialEq)]
pub struct Scaler {
    pub mean: FeatureVector,
    pub scale: FeatureVector,
}

impl Scaler {
    pub fn fit(rows: &[FeatureVector]) -> Self {
        let n = rows.len().max(1) as f64;
        let mut mean = [0.0; FEATURE_COUNT];
        for row in rows {
            for (acc, value) in mean.iter_mut().zip(row) {
                *acc += value;
            }
        }
        mean.iter_mut().for_each(|acc| *acc /= n);

        let mut scale = [0.0; FEATURE_COUNT];
        for row in rows {
            for ((acc, value), mu) in scale.iter_mut().zip(row).zip(&mean) {
                *acc += (value - mu).powi(2);
            }
        }
        for acc in scale.iter_mut() {
            let std = (*acc / n).sqrt();
            *acc = if std > f64::EPSILON { std } else { 1.0 };
        }

        Self { mean, scale }
    }

    pub fn transform(&self, row: &FeatureVector) -> FeatureVector {
        let mut out = [0.0; FEATURE_COUNT];
        for (i, value) in out.iter_mut().enumerate() {
            *value = (row[i] - self.mean[i]) / self.scale[i];
        }
        out
    }
}

/// Standardizes the (LP, MT, discrepancy) features with statistics from these
/// students alone.
pub fn standardize(students: &[StudentRecord]) -> (Vec<FeatureVector>, Scaler) {
    let raw: Vec<FeatureVector> = students.iter().map(raw_features).collect();
    let scaler = Scaler::fit(&raw);
    let scaled = raw.iter().map(|row| scaler.transform(row)).collect();
    (scaled, scaler)
}
