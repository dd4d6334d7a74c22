//! Operator-visible run log — a persisted JSON timeline of every action an
//! ingestion cycle takes. Pipeline errors never reach the read API; they
//! land here with the source name and a machine-readable category tag.
//!
//! Each cycle writes `{DATA_DIR}/ingest-runs/{region}/{run_id}.json`.
//! Raw text from malformed extractions is kept separately under
//! `{DATA_DIR}/rejected/` for offline inspection.

use std::path::{Path, PathBuf};

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

pub struct RunLog {
    pub run_id: String,
    pub region: String,
    pub started_at: DateTime<Utc>,
    events: Vec<RunEvent>,
    seq: u32,
}

#[derive(Serialize)]
struct RunEvent {
    seq: u32,
    ts: DateTime<Utc>,
    #[serde(flatten)]
    kind: EventKind,
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    CycleStarted {
        due_sources: usize,
        pending_reports: usize,
    },
    SourceFetched {
        source: String,
        observations: usize,
    },
    SourceFailed {
        source: String,
        /// Machine-readable tag: "transient" or "fatal".
        category: &'static str,
        error: String,
        consecutive_failures: u32,
    },
    SourceDeactivated {
        source: String,
    },
    ExtractionDeferred {
        source: String,
    },
    ExtractionRejected {
        source: String,
        reason: String,
        raw_path: Option<String>,
    },
    ReportIngested {
        source: String,
        external_id: String,
        incident_type: String,
        resolution: String,
    },
    ReportDuplicate {
        source: String,
        external_id: String,
    },
    ReportLinked {
        report_id: String,
        incident_id: String,
        score: f64,
        distance_m: f64,
    },
    IncidentCreated {
        incident_id: String,
        incident_type: String,
        review_status: String,
    },
}

impl RunLog {
    pub fn new(region: &str) -> Self {
        Self {
            run_id: format!("{}", Utc::now().format("%Y%m%dT%H%M%S%.3fZ")),
            region: region.to_string(),
            started_at: Utc::now(),
            events: Vec::new(),
            seq: 0,
        }
    }

    pub fn log(&mut self, kind: EventKind) {
        self.events.push(RunEvent {
            seq: self.seq,
            ts: Utc::now(),
            kind,
        });
        self.seq += 1;
    }

    /// Write the timeline to disk, returning the file path.
    pub fn save(&self, data_dir: &Path) -> Result<PathBuf> {
        let dir = data_dir.join("ingest-runs").join(&self.region);
        std::fs::create_dir_all(&dir)?;

        let path = dir.join(format!("{}.json", self.run_id));
        let output = SerializedRunLog {
            run_id: &self.run_id,
            region: &self.region,
            started_at: self.started_at,
            finished_at: Utc::now(),
            events: &self.events,
        };
        std::fs::write(&path, serde_json::to_string_pretty(&output)?)?;
        info!(path = %path.display(), events = self.events.len(), "Run log saved");
        Ok(path)
    }
}

#[derive(Serialize)]
struct SerializedRunLog<'a> {
    run_id: &'a str,
    region: &'a str,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
    events: &'a [RunEvent],
}

/// Keep raw text from a dropped extraction for offline inspection.
/// Returns the file path when the write succeeds.
pub fn save_rejected_text(data_dir: &Path, source_name: &str, raw_text: &str) -> Option<PathBuf> {
    let slug: String = source_name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    let dir = data_dir.join("rejected").join(slug);
    if let Err(e) = std::fs::create_dir_all(&dir) {
        tracing::warn!(error = %e, "Failed to create rejected-text dir");
        return None;
    }
    let path = dir.join(format!("{}.txt", Utc::now().format("%Y%m%dT%H%M%S%.3fZ")));
    match std::fs::write(&path, raw_text) {
        Ok(()) => Some(path),
        Err(e) => {
            tracing::warn!(error = %e, "Failed to write rejected text");
            None
        }
    }
}
