use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use tracing::{info, warn};

use ranger_common::Source;

use super::{content_hash, RawObservation, SourceAdapter};

const FEED_MAX_ITEMS: usize = 25;

/// RSS/Atom adapter built on reqwest + feed-rs. One observation per entry;
/// `external_id` is guid, falling back to link, falling back to an item hash.
pub struct FeedAdapter {
    client: reqwest::Client,
}

impl FeedAdapter {
    pub fn new(timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent("ranger-ingest/0.1")
            .build()
            .expect("Failed to build feed HTTP client");
        Self { client }
    }
}

#[async_trait]
impl SourceAdapter for FeedAdapter {
    async fn fetch(&self, source: &Source) -> Result<Vec<RawObservation>> {
        let resp = self
            .client
            .get(&source.url)
            .send()
            .await
            .with_context(|| format!("Feed fetch failed for {}", source.url))?
            .error_for_status()
            .with_context(|| format!("Feed returned error status for {}", source.url))?;

        let bytes = resp.bytes().await.context("Failed to read feed body")?;
        let feed = feed_rs::parser::parse(&bytes[..])
            .with_context(|| format!("Failed to parse RSS/Atom feed {}", source.url))?;

        let now = Utc::now();
        let mut observations = Vec::new();
        for entry in feed.entries.into_iter().take(FEED_MAX_ITEMS) {
            let link = entry.links.first().map(|l| l.href.clone());
            let title = entry.title.as_ref().map(|t| t.content.clone());
            let body = entry
                .summary
                .as_ref()
                .map(|s| s.content.clone())
                .or_else(|| entry.content.as_ref().and_then(|c| c.body.clone()))
                .unwrap_or_default();

            let raw_text = match &title {
                Some(t) if !body.is_empty() => format!("{t}\n\n{body}"),
                Some(t) => t.clone(),
                None if !body.is_empty() => body.clone(),
                None => {
                    warn!(feed = source.url.as_str(), "Skipping feed entry with no content");
                    continue;
                }
            };

            let external_id = if !entry.id.is_empty() {
                entry.id.clone()
            } else if let Some(link) = &link {
                link.clone()
            } else {
                content_hash(&raw_text)
            };

            observations.push(RawObservation {
                external_id,
                source_url: link.unwrap_or_else(|| source.url.clone()),
                raw_text,
                published_at: entry
                    .published
                    .or(entry.updated)
                    .map(|dt| dt.with_timezone(&Utc)),
                title,
                produced_at: now,
            });
        }

        info!(
            feed = source.url.as_str(),
            items = observations.len(),
            "Parsed feed"
        );
        Ok(observations)
    }

    fn name(&self) -> &str {
        "rss"
    }
}
