//! One adapter per source type. Adapters normalize raw payloads into
//! [`RawObservation`]s; everything downstream (extraction, geocoding, dedup)
//! is source-agnostic.

pub mod api;
pub mod audio;
pub mod feed;
pub mod html;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

use ranger_common::Source;

/// A single normalized observation from a source. `external_id` is the
/// source-local dedup key; retries of the same item must produce the same id.
#[derive(Debug, Clone)]
pub struct RawObservation {
    pub external_id: String,
    pub source_url: String,
    pub raw_text: String,
    pub published_at: Option<DateTime<Utc>>,
    pub title: Option<String>,
    pub produced_at: DateTime<Utc>,
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    /// Fetch the source and yield observations in source order. Per-item
    /// problems skip the item; an `Err` here is a whole-adapter failure and
    /// counts as a failed cycle for the scheduler.
    async fn fetch(&self, source: &Source) -> Result<Vec<RawObservation>>;

    fn name(&self) -> &str;
}

/// Short stable content hash used for external ids and change detection.
pub fn content_hash(content: &str) -> String {
    let digest = Sha256::digest(content.as_bytes());
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    hex[..16].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_hash_is_stable_and_short() {
        assert_eq!(content_hash("abc"), content_hash("abc"));
        assert_ne!(content_hash("abc"), content_hash("abd"));
        assert_eq!(content_hash("abc").len(), 16);
    }
}
