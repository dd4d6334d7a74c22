use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{info, warn};

use ranger_common::Source;

use super::{content_hash, RawObservation, SourceAdapter};

const API_MAX_ITEMS: usize = 100;

/// Structured agency API adapter: fetch a JSON document and emit one
/// observation per item. Adapter-level config keys:
///
/// - `items_pointer` — JSON pointer to the item array (default: the root
///   array, or the first of `items`/`results`/`data`/`features`)
/// - `id_field` — item field used as `external_id` (default: item hash)
/// - `published_field` — item field holding an RFC 3339 timestamp
pub struct ApiAdapter {
    client: reqwest::Client,
}

impl ApiAdapter {
    pub fn new(timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent("ranger-ingest/0.1")
            .build()
            .expect("Failed to build API HTTP client");
        Self { client }
    }

    fn items<'a>(
        source: &Source,
        document: &'a serde_json::Value,
    ) -> Option<&'a Vec<serde_json::Value>> {
        if let Some(pointer) = source.config.get("items_pointer").and_then(|v| v.as_str()) {
            return document.pointer(pointer).and_then(|v| v.as_array());
        }
        if let Some(items) = document.as_array() {
            return Some(items);
        }
        for key in ["items", "results", "data", "features"] {
            if let Some(items) = document.get(key).and_then(|v| v.as_array()) {
                return Some(items);
            }
        }
        None
    }
}

#[async_trait]
impl SourceAdapter for ApiAdapter {
    async fn fetch(&self, source: &Source) -> Result<Vec<RawObservation>> {
        let document: serde_json::Value = self
            .client
            .get(&source.url)
            .send()
            .await
            .with_context(|| format!("API fetch failed for {}", source.url))?
            .error_for_status()
            .with_context(|| format!("API returned error status for {}", source.url))?
            .json()
            .await
            .with_context(|| format!("API returned non-JSON body for {}", source.url))?;

        let Some(items) = Self::items(source, &document) else {
            anyhow::bail!("No item array found in API response from {}", source.url);
        };

        let id_field = source.config.get("id_field").and_then(|v| v.as_str());
        let published_field = source
            .config
            .get("published_field")
            .and_then(|v| v.as_str());

        let now = Utc::now();
        let mut observations = Vec::new();
        for item in items.iter().take(API_MAX_ITEMS) {
            let raw_text = match serde_json::to_string_pretty(item) {
                Ok(text) => text,
                Err(e) => {
                    warn!(url = source.url.as_str(), error = %e, "Skipping unserializable item");
                    continue;
                }
            };

            let external_id = id_field
                .and_then(|f| item.get(f))
                .map(json_scalar_string)
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| content_hash(&raw_text));

            let published_at = published_field
                .and_then(|f| item.get(f))
                .and_then(|v| v.as_str())
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|dt| dt.with_timezone(&Utc));

            observations.push(RawObservation {
                external_id,
                source_url: source.url.clone(),
                raw_text,
                published_at,
                title: None,
                produced_at: now,
            });
        }

        info!(
            url = source.url.as_str(),
            items = observations.len(),
            "Parsed API response"
        );
        Ok(observations)
    }

    fn name(&self) -> &str {
        "api"
    }
}

fn json_scalar_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ranger_common::{SourceCategory, SourceType};
    use uuid::Uuid;

    fn source(config: serde_json::Value) -> Source {
        Source {
            id: Uuid::new_v4(),
            name: "county api".to_string(),
            source_type: SourceType::Api,
            url: "https://example.test/api".to_string(),
            region: "mchenry_county".to_string(),
            category: SourceCategory::Crime,
            municipality: None,
            config,
            is_active: true,
            reliability_score: 0.5,
            last_fetched_at: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn finds_items_at_root_and_common_keys() {
        let root = serde_json::json!([{"a": 1}]);
        assert_eq!(
            ApiAdapter::items(&source(serde_json::json!({})), &root)
                .unwrap()
                .len(),
            1
        );

        let nested = serde_json::json!({"results": [{"a": 1}, {"a": 2}]});
        assert_eq!(
            ApiAdapter::items(&source(serde_json::json!({})), &nested)
                .unwrap()
                .len(),
            2
        );

        let pointed = serde_json::json!({"payload": {"rows": [{"a": 1}]}});
        assert_eq!(
            ApiAdapter::items(
                &source(serde_json::json!({"items_pointer": "/payload/rows"})),
                &pointed
            )
            .unwrap()
            .len(),
            1
        );
    }
}
