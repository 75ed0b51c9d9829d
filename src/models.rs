use std::fmt;
use std::str::FromStr;

/// Standardized (LP, MT, discrepancy) triple.
pub const FEATURE_COUNT: usize = 3;
pub type FeatureVector = [f64; FEATURE_COUNT];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Subject {
    Lp,
    Mt,
}

impl Subject {
    pub const ALL: [Subject; 2] = [Subject::Lp, Subject::Mt];

    pub fn code(self) -> &'static str {
        match self {
            Subject::Lp => "LP",
            Subject::Mt => "MT",
        }
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for Subject {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "LP" => Ok(Subject::Lp),
            "MT" => Ok(Subject::Mt),
            other => Err(format!("unknown subject {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RiskLabel {
    Normal,
    ModerateRisk,
    HighRisk,
    Exceptional,
}

impl RiskLabel {
    pub const ALL: [RiskLabel; 4] = [
        RiskLabel::HighRisk,
        RiskLabel::ModerateRisk,
        RiskLabel::Exceptional,
        RiskLabel::Normal,
    ];

    /// Text written to the result table, as the dashboard expects it.
    pub fn as_str(self) -> &'static str {
        match self {
            RiskLabel::Normal => "Normal",
            RiskLabel::ModerateRisk => "Risco Moderado",
            RiskLabel::HighRisk => "Alto Risco",
            RiskLabel::Exceptional => "Superdotação",
        }
    }

    pub fn is_at_risk(self) -> bool {
        matches!(self, RiskLabel::HighRisk | RiskLabel::ModerateRisk)
    }
}

impl fmt::Display for RiskLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RiskLabel {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        RiskLabel::ALL
            .into_iter()
            .find(|label| label.as_str() == value.trim())
            .ok_or_else(|| format!("unknown risk label {value}"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AnomalyFlag {
    Normal,
    Outlier,
}

impl AnomalyFlag {
    pub fn as_str(self) -> &'static str {
        match self {
            AnomalyFlag::Normal => "Normal",
            AnomalyFlag::Outlier => "Risco",
        }
    }

    /// Isolation-forest style code: 1 for inliers, -1 for outliers.
    pub fn code(self) -> i8 {
        match self {
            AnomalyFlag::Normal => 1,
            AnomalyFlag::Outlier => -1,
        }
    }

    pub fn is_outlier(self) -> bool {
        self == AnomalyFlag::Outlier
    }
}

impl FromStr for AnomalyFlag {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "Normal" => Ok(AnomalyFlag::Normal),
            "Risco" => Ok(AnomalyFlag::Outlier),
            other => Err(format!("unknown anomaly flag {other}")),
        }
    }
}

/// One student after cleaning. Later stages fill in the derived fields.
#[derive(Debug, Clone, PartialEq)]
pub struct StudentRecord {
    pub student_id: String,
    pub school_id: String,
    pub region_id: String,
    pub proficiency_lp: f64,
    pub proficiency_mt: f64,
    pub disability: Option<String>,
    pub exceptional: String,
    /// Signed LP - MT, the clustering feature.
    pub discrepancy: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LearningRisk {
    pub mean_proficiency: f64,
    pub abs_discrepancy: f64,
    pub flagged: bool,
}

/// A fully classified row of the per-student result table.
#[derive(Debug, Clone, PartialEq)]
pub struct StudentResult {
    pub student: StudentRecord,
    pub cluster: String,
    pub anomaly: AnomalyFlag,
    pub label: RiskLabel,
    pub learning_risk: LearningRisk,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemInfo {
    pub descriptor: String,
    pub answer: char,
    pub subject: Subject,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObservationKey {
    pub student_id: String,
    pub descriptor: String,
    pub subject: Subject,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScoredObservation {
    pub key: ObservationKey,
    pub correct: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupKey {
    pub cluster: String,
    pub subject: Subject,
    pub descriptor: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DiagnosticRow {
    pub cluster: String,
    pub subject: Subject,
    pub descriptor: String,
    pub error_rate: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SchoolSummary {
    pub school_id: String,
    pub total_students: usize,
    pub flagged_students: usize,
    pub flag_rate: f64,
    pub mean_lp: f64,
    pub mean_mt: f64,
}
