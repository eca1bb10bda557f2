use thiserror::Error;

/// Fixed wire-level message for the English-only policy. Tests and callers
/// match it verbatim, so it must never be reworded.
pub const LANGUAGE_POLICY_MESSAGE: &str = "Language policy violation: output must be English.";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{LANGUAGE_POLICY_MESSAGE}")]
    UnsupportedOutputLanguage(String),

    #[error("required model identifier missing: {0}")]
    MissingModel(&'static str),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config parse error: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("pdf parse error: {0}")]
    PdfParse(String),

    #[error("regex error: {0}")]
    RegexError(#[from] regex::Error),

    #[error("path has no file name: {0}")]
    MissingFileName(String),

    #[error("metadata store error: {0}")]
    Metadata(#[from] rusqlite::Error),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("index backend error: {0}")]
    Index(#[from] QueryError),
}

/// Query-time rejection of generated output. Surfaced to the caller verbatim
/// and never silently corrected.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PolicyViolation {
    #[error("{LANGUAGE_POLICY_MESSAGE}")]
    Language,

    #[error("Citation policy violation: {0}")]
    Citation(String),
}

#[derive(Debug, Error)]
pub enum QueryError {
    #[error(transparent)]
    Policy(#[from] PolicyViolation),

    #[error("metadata store error: {0}")]
    Metadata(#[from] rusqlite::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("serialize error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid response from {backend}: {details}")]
    BackendResponse { backend: String, details: String },

    #[error("{what} timed out after {millis}ms")]
    Timeout { what: &'static str, millis: u64 },

    #[error("generation failed: {0}")]
    Generation(String),

    #[error("request failed: {0}")]
    Request(String),
}

impl QueryError {
    /// Retrieval and generation failures may be retried by the caller;
    /// policy violations and metadata errors may not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            QueryError::Http(_)
                | QueryError::BackendResponse { .. }
                | QueryError::Timeout { .. }
                | QueryError::Generation(_)
                | QueryError::Request(_)
        )
    }
}

pub type Result<T, E = IngestError> = std::result::Result<T, E>;
