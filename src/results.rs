use std::io::{Read, Write};

use csv::ByteRecord;

use crate::error::{PipelineError, Result};
use crate::features::{
    COL_DISABILITY, COL_EXCEPTIONAL, COL_LP, COL_MT, COL_REGION_ID, COL_SCHOOL_ID, COL_STUDENT_ID,
};
use crate::items::{COL_DESCRIPTOR, COL_SUBJECT};
use crate::models::{DiagnosticRow, LearningRisk, SchoolSummary, StudentRecord, StudentResult};
use crate::table::{field, number_field, TableReader, TableWriter};

pub const COL_DISCREPANCY: &str = "DISCREPANCIA";
pub const COL_MEAN: &str = "MEDIA_PROFICIENCIAS";
pub const COL_ABS_DISCREPANCY: &str = "DISCREPANCIA_ABS";
pub const COL_LEARNING_RISK: &str = "RISCO_APRENDIZAGEM";
pub const COL_CLUSTER: &str = "CLUSTER";
pub const COL_ANOMALY: &str = "ANOMALIA";
pub const COL_ANOMALY_FLAG: &str = "FLAG_RISCO_ANOMALIA";
pub const COL_STATUS: &str = "STATUS_RISCO_FINAL";
pub const COL_ERROR_RATE: &str = "TAXA_ERRO";

const RESULT_COLUMNS: [&str; 15] = [
    COL_STUDENT_ID,
    COL_SCHOOL_ID,
    COL_REGION_ID,
    COL_LP,
    COL_MT,
    COL_DISABILITY,
    COL_EXCEPTIONAL,
    COL_DISCREPANCY,
    COL_MEAN,
    COL_ABS_DISCREPANCY,
    COL_LEARNING_RISK,
    COL_CLUSTER,
    COL_ANOMALY,
    COL_ANOMALY_FLAG,
    COL_STATUS,
];

pub fn write_results<W: Write>(writer: &mut TableWriter<W>, results: &[StudentResult]) -> Result<()> {
    writer.write_row(&RESULT_COLUMNS)?;
    for result in results {
        let student = &result.student;
        writer.write_row(&[
            student.student_id.clone(),
            student.school_id.clone(),
            student.region_id.clone(),
            student.proficiency_lp.to_string(),
            student.proficiency_mt.to_string(),
            student.disability.clone().unwrap_or_default(),
            student.exceptional.clone(),
            student.discrepancy.to_string(),
            result.learning_risk.mean_proficiency.to_string(),
            result.learning_risk.abs_discrepancy.to_string(),
            u8::from(result.learning_risk.flagged).to_string(),
            result.cluster.clone(),
            result.anomaly.code().to_string(),
            result.anomaly.as_str().to_string(),
            result.label.as_str().to_string(),
        ])?;
    }
    Ok(())
}

fn parsed<T: std::str::FromStr>(
    reader_path: &std::path::Path,
    record: &ByteRecord,
    index: usize,
    column: &str,
) -> Result<T> {
    field(record, index)
        .and_then(|value| value.parse::<T>().ok())
        .ok_or_else(|| PipelineError::schema(reader_path, column))
}

/// Reads a result table back. Cluster ids stay exactly as written.
pub fn read_results<R: Read>(reader: &mut TableReader<R>) -> Result<Vec<StudentResult>> {
    let columns = RESULT_COLUMNS
        .iter()
        .map(|name| reader.require(name))
        .collect::<Result<Vec<usize>>>()?;
    let path = reader.path().to_path_buf();
    let mut results = Vec::new();
    let mut record = ByteRecord::new();

    while reader.next_row(&mut record)? {
        let number = |slot: usize| {
            number_field(&record, columns[slot])
                .ok_or_else(|| PipelineError::schema(&path, RESULT_COLUMNS[slot]))
        };
        let text = |slot: usize| field(&record, columns[slot]).unwrap_or_default();

        let student = StudentRecord {
            student_id: text(0),
            school_id: text(1),
            region_id: text(2),
            proficiency_lp: number(3)?,
            proficiency_mt: number(4)?,
            disability: field(&record, columns[5]),
            exceptional: text(6),
            discrepancy: number(7)?,
        };
        results.push(StudentResult {
            student,
            cluster: text(11),
            anomaly: parsed(&path, &record, columns[13], COL_ANOMALY_FLAG)?,
            label: parsed(&path, &record, columns[14], COL_STATUS)?,
            learning_risk: LearningRisk {
                mean_proficiency: number(8)?,
                abs_discrepancy: number(9)?,
                flagged: text(10) == "1",
            },
        });
    }
    Ok(results)
}

pub fn write_diagnostics<W: Write>(writer: &mut TableWriter<W>, rows: &[DiagnosticRow]) -> Result<()> {
    writer.write_row(&[COL_CLUSTER, COL_SUBJECT, COL_DESCRIPTOR, COL_ERROR_RATE])?;
    for row in rows {
        writer.write_row(&[
            row.cluster.clone(),
            row.subject.code().to_string(),
            row.descriptor.clone(),
            row.error_rate.to_string(),
        ])?;
    }
    Ok(())
}

pub fn read_diagnostics<R: Read>(reader: &mut TableReader<R>) -> Result<Vec<DiagnosticRow>> {
    let cluster = reader.require(COL_CLUSTER)?;
    let subject = reader.require(COL_SUBJECT)?;
    let descriptor = reader.require(COL_DESCRIPTOR)?;
    let error_rate = reader.require(COL_ERROR_RATE)?;
    let path = reader.path().to_path_buf();
    let mut rows = Vec::new();
    let mut record = ByteRecord::new();

    while reader.next_row(&mut record)? {
        rows.push(DiagnosticRow {
            cluster: field(&record, cluster).unwrap_or_default(),
            subject: parsed(&path, &record, subject, COL_SUBJECT)?,
            descriptor: field(&record, descriptor).unwrap_or_default(),
            error_rate: number_field(&record, error_rate)
                .ok_or_else(|| PipelineError::schema(&path, COL_ERROR_RATE))?,
        });
    }
    Ok(rows)
}

pub fn write_school_summary<W: Write>(
    writer: &mut TableWriter<W>,
    summaries: &[SchoolSummary],
) -> Result<()> {
    writer.write_row(&[
        COL_SCHOOL_ID,
        "TOTAL_ALUNOS",
        "ALUNOS_RISCO",
        "TAXA_RISCO",
        "MEDIA_LP",
        "MEDIA_MT",
        "TAXA_RISCO_PCT",
    ])?;
    for summary in summaries {
        writer.write_row(&[
            summary.school_id.clone(),
            summary.total_students.to_string(),
            summary.flagged_students.to_string(),
            format!("{:.3}", summary.flag_rate),
            format!("{:.3}", summary.mean_lp),
            format!("{:.3}", summary.mean_mt),
            format!("{:.1}", summary.flag_rate * 100.0),
        ])?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AnomalyFlag, RiskLabel, Subject};

    fn sample() -> StudentResult {
        StudentResult {
            student: StudentRecord {
                student_id: "000123".into(),
                school_id: "35000012".into(),
                region_id: "35".into(),
                proficiency_lp: 212.75,
                proficiency_mt: 198.5,
                disability: Some("A".into()),
                exceptional: "B".into(),
                discrepancy: 14.25,
            },
            cluster: "04".into(),
            anomaly: AnomalyFlag::Outlier,
            label: RiskLabel::Exceptional,
            learning_risk: LearningRisk {
                mean_proficiency: 205.625,
                abs_discrepancy: 14.25,
                flagged: true,
            },
        }
    }

    #[test]
    fn result_table_round_trips_with_cluster_text_intact() {
        let mut writer = TableWriter::from_writer("res.csv", Vec::new());
        write_results(&mut writer, &[sample()]).unwrap();
        let bytes = writer.finish().unwrap();

        let mut reader = TableReader::from_reader("res.csv", bytes.as_slice()).unwrap();
        let back = read_results(&mut reader).unwrap();
        assert_eq!(back, vec![sample()]);
        assert_eq!(back[0].cluster, "04");
        assert_eq!(back[0].student.student_id, "000123");
    }

    #[test]
    fn result_table_is_latin1() {
        let mut writer = TableWriter::from_writer("res.csv", Vec::new());
        write_results(&mut writer, &[sample()]).unwrap();
        let bytes = writer.finish().unwrap();
        let text: String = bytes.iter().map(|&b| b as char).collect();
        assert!(text.starts_with("ID_ALUNO;ID_ESCOLA;ID_UF;PROFICIENCIA_LP"));
        assert!(bytes.windows(2).any(|w| w == b"\xe7\xe3"));
        assert!(text.contains(";-1;Risco;"));
    }

    #[test]
    fn diagnostic_table_round_trips() {
        let rows = vec![DiagnosticRow {
            cluster: "3".into(),
            subject: Subject::Mt,
            descriptor: "D12".into(),
            error_rate: 0.4375,
        }];
        let mut writer = TableWriter::from_writer("diag.csv", Vec::new());
        write_diagnostics(&mut writer, &rows).unwrap();
        let bytes = writer.finish().unwrap();
        assert!(bytes.starts_with(b"CLUSTER;TP_DISCIPLINA;NU_DESCRITOR_HABILIDADE;TAXA_ERRO\n"));

        let mut reader = TableReader::from_reader("diag.csv", bytes.as_slice()).unwrap();
        assert_eq!(read_diagnostics(&mut reader).unwrap(), rows);
    }

    #[test]
    fn unreadable_status_is_reported_with_its_column() {
        let mut writer = TableWriter::from_writer("res.csv", Vec::new());
        write_results(&mut writer, &[sample()]).unwrap();
        let text = String::from_utf8_lossy(&writer.finish().unwrap())
            .replace("Superdota\u{FFFD}\u{FFFD}o", "Talvez");
        let mut reader = TableReader::from_reader("res.csv", text.as_bytes()).unwrap();
        let err = read_results(&mut reader).unwrap_err();
        assert!(err.to_string().contains(COL_STATUS));
    }
}
