use thiserror::Error;

#[derive(Error, Debug)]
pub enum RangerError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Fetch error for {source_name}: {message}")]
    Fetch { source_name: String, message: String },

    #[error("Extraction error: {0}")]
    Extraction(String),

    #[error("Malformed extractor output: {0}")]
    MalformedExtraction(String),

    #[error("Geocoding error: {0}")]
    Geocode(String),

    #[error("Rate limited: {0}")]
    RateLimited(&'static str),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Incident not found: {0}")]
    IncidentNotFound(uuid::Uuid),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, RangerError>;
