use thiserror::Error;

pub type Result<T> = std::result::Result<T, IngestError>;

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("No repeating structure found in {0}")]
    NoStructure(String),

    #[error("Record path '{0}' resolves to nothing")]
    RecordPathNotFound(String),

    #[error("Supported paths are /A/B or /A/B/C or /A/B/C/D/E. Got: {0}")]
    UnsupportedPath(String),

    #[error("Child path '{child}' does not extend parent path '{parent}'")]
    ChildPathMismatch { parent: String, child: String },

    #[error("Unknown collection '{0}'")]
    UnknownCollection(String),

    #[error("Unsupported format '{0}'. Use xml|json|jsonl|csv|xlsx")]
    UnsupportedFormat(String),

    #[error("Invalid mapping: {0}")]
    Mapping(String),

    #[error("XML error: {0}")]
    Xml(#[from] quick_xml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Spreadsheet error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("Pattern error: {0}")]
    Pattern(#[from] regex::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Encoding error: {0}")]
    Encoding(String),

    #[error("Metadata store error: {0}")]
    Metadata(String),
}

impl IngestError {
    /// Structural failures abort the source before any rows are produced.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            IngestError::NoStructure(_)
                | IngestError::RecordPathNotFound(_)
                | IngestError::UnsupportedPath(_)
                | IngestError::ChildPathMismatch { .. }
        )
    }
}
