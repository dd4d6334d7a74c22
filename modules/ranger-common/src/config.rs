use std::env;
use std::path::PathBuf;

/// Application configuration loaded from environment variables.
/// Secrets never come from files; the sources document carries no credentials.
#[derive(Debug, Clone)]
pub struct Config {
    /// Postgres connection string (service-role credentials).
    pub database_url: String,

    // AI provider
    pub anthropic_api_key: String,
    /// Model used for incident extraction.
    pub extraction_model: String,

    // Parcel geocoder
    pub geocode_api_key: String,
    pub geocode_base_url: String,

    // Audio transcription endpoint (Whisper-style); empty disables audio sources.
    pub transcribe_url: String,

    // Region
    pub region: String,

    /// Path to the source-configuration document.
    pub sources_path: PathBuf,

    /// Data directory for run logs and rejected-extraction text.
    pub data_dir: PathBuf,

    /// Concurrent source fetches per cycle.
    pub fetch_concurrency: usize,

    // Read API
    pub api_host: String,
    pub api_port: u16,
}

impl Config {
    /// Load pipeline configuration. Panics with a clear message if required
    /// vars are missing.
    pub fn from_env() -> Self {
        Self {
            database_url: required_env("DATABASE_URL"),
            anthropic_api_key: required_env("ANTHROPIC_API_KEY"),
            extraction_model: env::var("EXTRACTION_MODEL")
                .unwrap_or_else(|_| "claude-haiku-4-5-20251001".to_string()),
            geocode_api_key: env::var("GEOCODE_API_KEY").unwrap_or_default(),
            geocode_base_url: env::var("GEOCODE_BASE_URL")
                .unwrap_or_else(|_| "https://api.geocod.io/v1.7".to_string()),
            transcribe_url: env::var("TRANSCRIBE_URL").unwrap_or_default(),
            region: env::var("REGION").unwrap_or_else(|_| "mchenry_county".to_string()),
            sources_path: PathBuf::from(
                env::var("SOURCES_PATH").unwrap_or_else(|_| "sources.json".to_string()),
            ),
            data_dir: PathBuf::from(env::var("DATA_DIR").unwrap_or_else(|_| "data".to_string())),
            fetch_concurrency: env::var("FETCH_CONCURRENCY")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(8),
            api_host: env::var("API_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            api_port: env::var("API_PORT")
                .unwrap_or_else(|_| "3000".to_string())
                .parse()
                .expect("API_PORT must be a number"),
        }
    }

    /// Load config for the read API (no AI or geocoder keys needed).
    pub fn api_from_env() -> Self {
        Self {
            database_url: required_env("DATABASE_URL"),
            anthropic_api_key: String::new(),
            extraction_model: String::new(),
            geocode_api_key: String::new(),
            geocode_base_url: String::new(),
            transcribe_url: String::new(),
            region: env::var("REGION").unwrap_or_else(|_| "mchenry_county".to_string()),
            sources_path: PathBuf::new(),
            data_dir: PathBuf::from(env::var("DATA_DIR").unwrap_or_else(|_| "data".to_string())),
            fetch_concurrency: 0,
            api_host: env::var("API_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            api_port: env::var("API_PORT")
                .unwrap_or_else(|_| "3000".to_string())
                .parse()
                .expect("API_PORT must be a number"),
        }
    }

    /// Log key presence without leaking values.
    pub fn log_redacted(&self) {
        let vars = [
            ("DATABASE_URL", &self.database_url),
            ("ANTHROPIC_API_KEY", &self.anthropic_api_key),
            ("GEOCODE_API_KEY", &self.geocode_api_key),
            ("TRANSCRIBE_URL", &self.transcribe_url),
        ];
        for (name, value) in vars {
            if value.is_empty() {
                tracing::info!("{name} = (empty)");
            } else {
                tracing::info!("{name} = ({} chars)", value.len());
            }
        }
    }
}

fn required_env(key: &str) -> String {
    env::var(key).unwrap_or_else(|_| panic!("{key} environment variable is required"))
}
