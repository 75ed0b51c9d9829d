use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, PipelineError>;

/// Failures that abort a grade's run. Unscorable answer characters never
/// surface here; the scorer skips and counts them.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("input not found: {}", path.display())]
    InputNotFound { path: PathBuf },

    #[error("no scorable item survived filtering in {}", path.display())]
    EmptyMapping { path: PathBuf },

    #[error("column {column} is missing or unreadable in {}", path.display())]
    SchemaMismatch { path: PathBuf, column: String },

    #[error("failed to parse {}: {source}", path.display())]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("grade {grade} has {students} students, fewer than the {clusters} clusters requested")]
    InsufficientData {
        grade: String,
        students: usize,
        clusters: usize,
    },
}

impl PipelineError {
    pub fn csv(path: impl Into<PathBuf>, source: csv::Error) -> Self {
        let path = path.into();
        if let csv::ErrorKind::Io(io) = source.kind() {
            if io.kind() == std::io::ErrorKind::NotFound {
                return PipelineError::InputNotFound { path };
            }
        }
        PipelineError::Csv { path, source }
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        let path = path.into();
        if source.kind() == std::io::ErrorKind::NotFound {
            return PipelineError::InputNotFound { path };
        }
        PipelineError::Io { path, source }
    }

    pub fn schema(path: impl Into<PathBuf>, column: &str) -> Self {
        PipelineError::SchemaMismatch {
            path: path.into(),
            column: column.to_string(),
        }
    }
}
