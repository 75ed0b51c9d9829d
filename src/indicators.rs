//! Threshold-based learning-risk indicator and its per-school rollup.
//!
//! This flag is independent of the cluster-based label: it uses the absolute
//! LP/MT gap, while clustering uses the signed one.

use std::collections::HashMap;

use crate::anomaly::quantile;
use crate::models::{LearningRisk, SchoolSummary, StudentRecord, StudentResult};

pub const LOW_MEAN_QUANTILE: f64 = 0.3;
pub const HIGH_GAP_QUANTILE: f64 = 0.7;

/// Flags students whose mean proficiency falls below the grade's 30th
/// percentile or whose absolute LP/MT gap exceeds its 70th percentile.
pub fn learning_risk(students: &[StudentRecord]) -> Vec<LearningRisk> {
    let means: Vec<f64> = students
        .iter()
        .map(|s| (s.proficiency_lp + s.proficiency_mt) / 2.0)
        .collect();
    let gaps: Vec<f64> = students
        .iter()
        .map(|s| (s.proficiency_lp - s.proficiency_mt).abs())
        .collect();
    let mean_cut = quantile(&means, LOW_MEAN_QUANTILE);
    let gap_cut = quantile(&gaps, HIGH_GAP_QUANTILE);

    means
        .into_iter()
        .zip(gaps)
        .map(|(mean_proficiency, abs_discrepancy)| LearningRisk {
            mean_proficiency,
            abs_discrepancy,
            flagged: mean_proficiency < mean_cut || abs_discrepancy > gap_cut,
        })
        .collect()
}

/// Per-school totals, sorted by flag rate, highest first.
pub fn summarize_by_school(results: &[StudentResult]) -> Vec<SchoolSummary> {
    let mut map: HashMap<&str, (usize, usize, f64, f64)> = HashMap::new();

    for result in results {
        let entry = map
            .entry(result.student.school_id.as_str())
            .or_insert((0, 0, 0.0, 0.0));
        entry.0 += 1;
        entry.1 += usize::from(result.learning_risk.flagged);
        entry.2 += result.student.proficiency_lp;
        entry.3 += result.student.proficiency_mt;
    }

    let mut summaries: Vec<SchoolSummary> = map
        .into_iter()
        .map(|(school_id, (total, flagged, lp, mt))| {
            let n = total as f64;
            SchoolSummary {
                school_id: school_id.to_string(),
                total_students: total,
                flagged_students: flagged,
                flag_rate: flagged as f64 / n,
                mean_lp: lp / n,
                mean_mt: mt / n,
            }
        })
        .collect();

    summaries.sort_by(|a, b| {
        b.flag_rate
            .total_cmp(&a.flag_rate)
            .then_with(|| b.total_students.cmp(&a.total_students))
            .then_with(|| a.school_id.cmp(&b.school_id))
    });
    summaries
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AnomalyFlag, RiskLabel};

    fn student(id: &str, school: &str, lp: f64, mt: f64) -> StudentRecord {
        StudentRecord {
            student_id: id.to_string(),
            school_id: school.to_string(),
            region_id: "35".to_string(),
            proficiency_lp: lp,
            proficiency_mt: mt,
            disability: None,
            exceptional: "A".to_string(),
            discrepancy: lp - mt,
        }
    }

    #[test]
    fn flags_low_mean_or_wide_gap() {
        let students = vec![
            student("1", "s", 100.0, 100.0),
            student("2", "s", 200.0, 200.0),
            student("3", "s", 210.0, 190.0),
            student("4", "s", 300.0, 150.0),
            student("5", "s", 220.0, 220.0),
        ];
        let risk = learning_risk(&students);
        assert!(risk[0].flagged, "lowest mean");
        assert!(risk[3].flagged, "widest gap");
        assert!(!risk[1].flagged);
        assert!(!risk[4].flagged);
        assert_eq!(risk[3].abs_discrepancy, 150.0);
        assert_eq!(risk[2].mean_proficiency, 200.0);
    }

    #[test]
    fn schools_are_ranked_by_flag_rate() {
        let results: Vec<StudentResult> = [
            ("1", "A", true),
            ("2", "A", false),
            ("3", "B", true),
            ("4", "B", true),
            ("5", "C", false),
        ]
        .into_iter()
        .map(|(id, school, flagged)| StudentResult {
            student: student(id, school, 200.0, 180.0),
            cluster: "0".to_string(),
            anomaly: AnomalyFlag::Normal,
            label: RiskLabel::Normal,
            learning_risk: LearningRisk {
                mean_proficiency: 190.0,
                abs_discrepancy: 20.0,
                flagged,
            },
        })
        .collect();

        let summaries = summarize_by_school(&results);
        let order: Vec<&str> = summaries.iter().map(|s| s.school_id.as_str()).collect();
        assert_eq!(order, vec!["B", "A", "C"]);
        assert_eq!(summaries[1].flagged_students, 1);
        assert_eq!(summaries[1].flag_rate, 0.5);
        assert_eq!(summaries[0].mean_lp, 200.0);
    }
}
