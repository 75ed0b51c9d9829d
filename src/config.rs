use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{PipelineError, Result};

/// How per-batch partial means are combined into the final error rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
#[value(rename_all = "snake_case")]
pub enum AggregationMode {
    /// Weighted by observation counts; equals the unbatched mean.
    #[default]
    Pooled,
    /// Every batch weighs the same, matching historical output.
    MeanOfMeans,
}

/// Cluster ids partitioned into risk roles for one grade.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskConfig {
    pub high: BTreeSet<String>,
    pub moderate: BTreeSet<String>,
    pub baseline: BTreeSet<String>,
}

impl RiskConfig {
    pub fn new<S: Into<String>>(
        high: impl IntoIterator<Item = S>,
        moderate: impl IntoIterator<Item = S>,
        baseline: impl IntoIterator<Item = S>,
    ) -> Self {
        Self {
            high: high.into_iter().map(Into::into).collect(),
            moderate: moderate.into_iter().map(Into::into).collect(),
            baseline: baseline.into_iter().map(Into::into).collect(),
        }
    }

    /// Role name shown next to a cluster in reports.
    pub fn role_of(&self, cluster: &str) -> &'static str {
        if self.high.contains(cluster) {
            "high"
        } else if self.moderate.contains(cluster) {
            "moderate"
        } else if self.baseline.contains(cluster) {
            "baseline"
        } else {
            "unassigned"
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GradeConfig {
    pub n_clusters: usize,
    pub risk: RiskConfig,
    #[serde(default)]
    pub legend: BTreeMap<String, String>,
    /// Subject code to descriptor codes left out of the hardest-skills list.
    #[serde(default)]
    pub hidden_skills: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub skill_matrix: Option<PathBuf>,
    pub students: PathBuf,
    pub results: PathBuf,
    pub diagnostics: PathBuf,
    pub school_report: PathBuf,
    pub report: PathBuf,
}

impl GradeConfig {
    fn reference(grade: &str) -> Self {
        let mut hidden_skills = BTreeMap::new();
        if grade == "5EF" {
            hidden_skills.insert("LP".to_string(), vec!["D20".to_string(), "D18".to_string()]);
            hidden_skills.insert(
                "MT".to_string(),
                vec!["D34".to_string(), "D35".to_string(), "D36".to_string()],
            );
        }

        Self {
            n_clusters: 7,
            risk: RiskConfig::new(["1", "2", "3"], ["5", "6"], ["4", "0"]),
            legend: BTreeMap::new(),
            hidden_skills,
            skill_matrix: None,
            students: PathBuf::from(format!("TS_ALUNO_{grade}.csv")),
            results: PathBuf::from(format!("resultados_finais_{grade}.csv")),
            diagnostics: PathBuf::from(format!("diagnostico_habilidades_{grade}.csv")),
            school_report: PathBuf::from(format!("risco_por_escola_{grade}.csv")),
            report: PathBuf::from(format!("relatorio_{grade}.md")),
        }
    }

    pub fn is_hidden(&self, subject: &str, descriptor: &str) -> bool {
        self.hidden_skills
            .get(subject)
            .is_some_and(|codes| codes.iter().any(|code| code == descriptor))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub seed: u64,
    pub contamination: f64,
    pub batch_size: usize,
    #[serde(default)]
    pub aggregation: AggregationMode,
    pub items: PathBuf,
    pub descriptor_pattern: String,
    pub excluded_answers: Vec<String>,
    pub answer_letters: String,
    pub exceptional_yes: String,
    pub exceptional_default: String,
    pub grades: BTreeMap<String, GradeConfig>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let grades = ["5EF", "9EF"]
            .into_iter()
            .map(|grade| (grade.to_string(), GradeConfig::reference(grade)))
            .collect();

        Self {
            seed: 42,
            contamination: 0.05,
            batch_size: 250_000,
            aggregation: AggregationMode::Pooled,
            items: PathBuf::from("TS_ITEM.csv"),
            descriptor_pattern: r"^D\d+$".to_string(),
            excluded_answers: vec!["X".to_string(), "E".to_string()],
            answer_letters: "ABCDE".to_string(),
            exceptional_yes: "B".to_string(),
            exceptional_default: "A".to_string(),
            grades,
        }
    }
}

impl PipelineConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|err| PipelineError::io(path, err))?;
        serde_json::from_str(&text)
            .map_err(|err| PipelineError::Config(format!("{}: {err}", path.display())))
    }

    /// The configuration at `path`, or the reference deployment, validated.
    pub fn resolve(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let text = serde_json::to_string_pretty(self)
            .map_err(|err| PipelineError::Config(err.to_string()))?;
        std::fs::write(path, text).map_err(|err| PipelineError::io(path, err))
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(PipelineError::Config("batch_size must be positive".into()));
        }
        if !(self.contamination > 0.0 && self.contamination <= 0.5) {
            return Err(PipelineError::Config(format!(
                "contamination must be in (0, 0.5], got {}",
                self.contamination
            )));
        }
        if self.answer_letters.is_empty() {
            return Err(PipelineError::Config("answer_letters is empty".into()));
        }
        self.descriptor_regex()?;

        for (grade, config) in &self.grades {
            if config.n_clusters == 0 {
                return Err(PipelineError::Config(format!(
                    "grade {grade}: n_clusters must be positive"
                )));
            }
            let unassigned: Vec<String> = (0..config.n_clusters)
                .map(|id| id.to_string())
                .filter(|id| config.risk.role_of(id) == "unassigned")
                .collect();
            if !unassigned.is_empty() {
                warn!(
                    grade = %grade,
                    clusters = ?unassigned,
                    "cluster ids have no risk role and will be labeled Normal"
                );
            }
        }
        Ok(())
    }

    pub fn descriptor_regex(&self) -> Result<Regex> {
        Regex::new(&self.descriptor_pattern).map_err(|err| {
            PipelineError::Config(format!(
                "descriptor_pattern {:?}: {err}",
                self.descriptor_pattern
            ))
        })
    }

    pub fn grade(&self, grade: &str) -> Result<&GradeConfig> {
        self.grades
            .get(grade)
            .ok_or_else(|| PipelineError::Config(format!("grade {grade} is not configured")))
    }

    /// Grades to run: the one asked for, or every configured grade.
    pub fn selected_grades(&self, only: Option<&str>) -> Vec<String> {
        match only {
            Some(grade) => vec![grade.to_string()],
            None => self.grades.keys().cloned().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_matches_reference_deployment() {
        let config = PipelineConfig::default();
        assert_eq!(config.seed, 42);
        assert_eq!(config.batch_size, 250_000);
        assert_eq!(config.aggregation, AggregationMode::Pooled);
        assert_eq!(config.grades.len(), 2);
        let grade = config.grade("5EF").unwrap();
        assert_eq!(grade.n_clusters, 7);
        assert_eq!(grade.risk.role_of("2"), "high");
        assert_eq!(grade.risk.role_of("6"), "moderate");
        assert_eq!(grade.risk.role_of("0"), "baseline");
        assert_eq!(grade.risk.role_of("9"), "unassigned");
        assert!(grade.is_hidden("LP", "D18"));
        assert!(grade.is_hidden("MT", "D36"));
        assert!(config.grade("9EF").unwrap().hidden_skills.is_empty());
        config.validate().unwrap();
    }

    #[test]
    fn resolve_validates_default_and_loaded_configs() {
        assert_eq!(PipelineConfig::resolve(None).unwrap(), PipelineConfig::default());

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipeline.json");
        let mut config = PipelineConfig::default();
        config.batch_size = 0;
        config.save(&path).unwrap();
        assert!(PipelineConfig::load(&path).is_ok());
        assert!(matches!(
            PipelineConfig::resolve(Some(path.as_path())),
            Err(PipelineError::Config(_))
        ));
    }

    #[test]
    fn aggregation_mode_has_one_spelling() {
        use clap::ValueEnum;

        assert_eq!(
            AggregationMode::from_str("mean_of_means", false),
            Ok(AggregationMode::MeanOfMeans)
        );
        assert!(AggregationMode::from_str("mean-of-means", false).is_err());
        assert_eq!(
            serde_json::to_string(&AggregationMode::MeanOfMeans).unwrap(),
            "\"mean_of_means\""
        );
    }

    #[test]
    fn config_survives_json_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipeline.json");
        let mut config = PipelineConfig::default();
        config.aggregation = AggregationMode::MeanOfMeans;
        config
            .grades
            .get_mut("9EF")
            .unwrap()
            .hidden_skills
            .insert("MT".into(), vec!["D34".into()]);

        config.save(&path).unwrap();
        let loaded = PipelineConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
        assert!(loaded.grade("9EF").unwrap().is_hidden("MT", "D34"));
        assert!(!loaded.grade("9EF").unwrap().is_hidden("LP", "D34"));
    }

    #[test]
    fn rejects_invalid_settings() {
        let mut config = PipelineConfig::default();
        config.batch_size = 0;
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::default();
        config.contamination = 0.9;
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::default();
        config.descriptor_pattern = "^D(".into();
        assert!(matches!(config.validate(), Err(PipelineError::Config(_))));
    }

    #[test]
    fn unknown_grade_is_a_config_error() {
        let config = PipelineConfig::default();
        assert!(config.grade("3EM").is_err());
        assert_eq!(config.selected_grades(None), vec!["5EF", "9EF"]);
    }
}
