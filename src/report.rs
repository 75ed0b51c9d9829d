use std::collections::{BTreeMap, HashMap};
use std::fmt::Write;
use std::io::Read;

use chrono::{DateTime, Utc};
use csv::ByteRecord;
use uuid::Uuid;

use crate::config::GradeConfig;
use crate::error::Result;
use crate::indicators::summarize_by_school;
use crate::items::{COL_DESCRIPTOR, COL_SUBJECT};
use crate::models::{DiagnosticRow, RiskLabel, StudentResult, Subject};
use crate::table::{field, TableReader};
use crate::text::repair_mojibake;

pub const COL_DESCRIPTION: &str = "DESCRICAO";
const TOP_N: usize = 10;

/// Skill code and subject to its official description.
pub type SkillDescriptions = HashMap<(Subject, String), String>;

pub fn load_skill_descriptions<R: Read>(reader: &mut TableReader<R>) -> Result<SkillDescriptions> {
    let descriptor = reader.require(COL_DESCRIPTOR)?;
    let subject = reader.require(COL_SUBJECT)?;
    let description = reader.require(COL_DESCRIPTION)?;
    let mut descriptions = SkillDescriptions::new();
    let mut record = ByteRecord::new();

    while reader.next_row(&mut record)? {
        let parsed = (
            field(&record, subject).and_then(|s| s.parse::<Subject>().ok()),
            field(&record, descriptor),
            field(&record, description),
        );
        if let (Some(subject), Some(code), Some(text)) = parsed {
            descriptions.insert((subject, code), repair_mojibake(&text));
        }
    }
    Ok(descriptions)
}

#[derive(Debug, Clone, PartialEq)]
pub struct Overview {
    pub total_students: usize,
    pub at_risk: usize,
    pub mean_lp: f64,
    pub mean_mt: f64,
}

pub fn overview(results: &[StudentResult]) -> Overview {
    let n = results.len().max(1) as f64;
    Overview {
        total_students: results.len(),
        at_risk: results.iter().filter(|r| r.label.is_at_risk()).count(),
        mean_lp: results.iter().map(|r| r.student.proficiency_lp).sum::<f64>() / n,
        mean_mt: results.iter().map(|r| r.student.proficiency_mt).sum::<f64>() / n,
    }
}

pub fn count_by_label(results: &[StudentResult]) -> Vec<(RiskLabel, usize)> {
    RiskLabel::ALL
        .into_iter()
        .map(|label| (label, results.iter().filter(|r| r.label == label).count()))
        .filter(|(_, count)| *count > 0)
        .collect()
}

pub fn count_by_cluster(results: &[StudentResult]) -> BTreeMap<&str, usize> {
    let mut counts = BTreeMap::new();
    for result in results {
        *counts.entry(result.cluster.as_str()).or_insert(0) += 1;
    }
    counts
}

/// Skills with the highest error rate averaged over clusters, hidden skills
/// left out.
pub fn hardest_skills(
    rows: &[DiagnosticRow],
    subject: Subject,
    config: &GradeConfig,
) -> Vec<(String, f64)> {
    let mut totals: HashMap<&str, (f64, usize)> = HashMap::new();
    for row in rows.iter().filter(|row| row.subject == subject) {
        if config.is_hidden(subject.code(), &row.descriptor) {
            continue;
        }
        let entry = totals.entry(row.descriptor.as_str()).or_insert((0.0, 0));
        entry.0 += row.error_rate;
        entry.1 += 1;
    }

    let mut skills: Vec<(String, f64)> = totals
        .into_iter()
        .map(|(code, (sum, count))| (code.to_string(), sum / count as f64))
        .collect();
    skills.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    skills.truncate(TOP_N);
    skills
}

pub struct ReportInput<'a> {
    pub grade: &'a str,
    pub run_id: Uuid,
    pub generated_at: DateTime<Utc>,
    pub config: &'a GradeConfig,
    pub results: &'a [StudentResult],
    pub diagnostics: Option<&'a [DiagnosticRow]>,
    pub descriptions: &'a SkillDescriptions,
}

pub fn build_report(input: &ReportInput<'_>) -> String {
    let mut output = String::new();
    let summary = overview(input.results);

    let _ = writeln!(output, "# Early Warning Report: {}", input.grade);
    let _ = writeln!(
        output,
        "Generated {} (run {})",
        input.generated_at.format("%Y-%m-%d %H:%M UTC"),
        input.run_id
    );
    let _ = writeln!(output);
    let _ = writeln!(output, "## Overview");
    let _ = writeln!(output, "- Students: {}", summary.total_students);
    let _ = writeln!(output, "- At high or moderate risk: {}", summary.at_risk);
    let _ = writeln!(output, "- Mean LP proficiency: {:.2}", summary.mean_lp);
    let _ = writeln!(output, "- Mean MT proficiency: {:.2}", summary.mean_mt);

    let _ = writeln!(output);
    let _ = writeln!(output, "## Risk Status Mix");
    let labels = count_by_label(input.results);
    if labels.is_empty() {
        let _ = writeln!(output, "No students classified for this grade.");
    } else {
        for (label, count) in labels {
            let _ = writeln!(output, "- {label}: {count}");
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Cluster Profiles");
    for (cluster, count) in count_by_cluster(input.results) {
        let legend = input
            .config
            .legend
            .get(cluster)
            .cloned()
            .unwrap_or_else(|| format!("Cluster {cluster} (no legend)"));
        let _ = writeln!(
            output,
            "- {cluster}: {legend}, {count} students, role {}",
            input.config.risk.role_of(cluster)
        );
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Schools With Highest Learning-Risk Rate");
    let schools = summarize_by_school(input.results);
    if schools.is_empty() {
        let _ = writeln!(output, "No schools in this grade.");
    } else {
        for school in schools.iter().take(TOP_N) {
            let _ = writeln!(
                output,
                "- {}: {:.1}% of {} students (LP {:.1}, MT {:.1})",
                school.school_id,
                school.flag_rate * 100.0,
                school.total_students,
                school.mean_lp,
                school.mean_mt
            );
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Hardest Skills");
    let Some(rows) = input.diagnostics else {
        let _ = writeln!(output, "No skill diagnostics available.");
        return output;
    };
    for subject in Subject::ALL {
        let _ = writeln!(output);
        let _ = writeln!(output, "### {subject}");
        let skills = hardest_skills(rows, subject, input.config);
        if skills.is_empty() {
            let _ = writeln!(output, "No skills scored.");
            continue;
        }
        for (code, error_rate) in skills {
            let description = input
                .descriptions
                .get(&(subject, code.clone()))
                .cloned()
                .unwrap_or_else(|| format!("{code} (description not available)"));
            let _ = writeln!(
                output,
                "- {code}: {:.1}% error. {description}",
                error_rate * 100.0
            );
        }
    }

    output
}
