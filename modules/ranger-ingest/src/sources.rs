//! The source-configuration document: a JSON list of source entries read at
//! startup and upserted into the store by url. Disabled entries are skipped.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::info;

use ranger_common::{Source, SourceCategory, SourceType};
use ranger_store::{IncidentStore, SourceSpec};

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SourceEntry {
    pub name: String,
    pub source_type: SourceType,
    pub url: String,
    pub region: String,
    pub category: SourceCategory,
    #[serde(default)]
    pub municipality: Option<String>,
    pub enabled: bool,
    #[serde(default)]
    pub config: Option<serde_json::Value>,
}

pub fn load_sources(path: &Path) -> Result<Vec<SourceEntry>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read sources document: {}", path.display()))?;
    let entries: Vec<SourceEntry> = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse sources document: {}", path.display()))?;
    Ok(entries)
}

/// Upsert every enabled entry; returns the active sources after the sync.
pub async fn sync_sources(
    store: &Arc<dyn IncidentStore>,
    entries: &[SourceEntry],
) -> Result<Vec<Source>> {
    let mut upserted = 0usize;
    for entry in entries.iter().filter(|e| e.enabled) {
        store
            .upsert_source(&SourceSpec {
                name: entry.name.clone(),
                source_type: entry.source_type,
                url: entry.url.clone(),
                region: entry.region.clone(),
                category: entry.category,
                municipality: entry.municipality.clone(),
                config: entry.config.clone().unwrap_or_else(|| serde_json::json!({})),
            })
            .await?;
        upserted += 1;
    }
    info!(
        entries = entries.len(),
        upserted, "Source configuration synced"
    );
    Ok(store.active_sources().await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ranger_store::MemoryStore;

    const DOC: &str = r#"[
        {
            "name": "Northwest Herald police blotter",
            "source_type": "rss",
            "url": "https://example.test/blotter/feed",
            "region": "mchenry_county",
            "category": "news",
            "enabled": true,
            "config": {"poll_interval_s": 600}
        },
        {
            "name": "County dispatch scanner",
            "source_type": "audio",
            "url": "https://example.test/scanner",
            "region": "mchenry_county",
            "category": "crime",
            "municipality": "Crystal Lake",
            "enabled": false
        }
    ]"#;

    #[test]
    fn document_parses() {
        let entries: Vec<SourceEntry> = serde_json::from_str(DOC).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].source_type, SourceType::Rss);
        assert!(!entries[1].enabled);
        assert_eq!(entries[1].municipality.as_deref(), Some("Crystal Lake"));
    }

    #[tokio::test]
    async fn disabled_entries_are_skipped_and_upsert_is_idempotent() {
        let store: Arc<dyn IncidentStore> = Arc::new(MemoryStore::new());
        let entries: Vec<SourceEntry> = serde_json::from_str(DOC).unwrap();

        let sources = sync_sources(&store, &entries).await.unwrap();
        assert_eq!(sources.len(), 1);
        assert_eq!(sources[0].name, "Northwest Herald police blotter");

        // Re-running the sync must not duplicate the source.
        let sources = sync_sources(&store, &entries).await.unwrap();
        assert_eq!(sources.len(), 1);
    }
}
