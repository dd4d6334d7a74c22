use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use regex::Regex;
use tracing::{debug, info};
use uuid::Uuid;

use ranger_common::Source;

use super::{content_hash, RawObservation, SourceAdapter};

/// HTML page adapter. Fetches the page, strips markup to text, and emits one
/// observation covering the page; the extraction engine is responsible for
/// making sense of the content. Pages whose body hash is unchanged since the
/// last fetch emit nothing.
pub struct HtmlAdapter {
    client: reqwest::Client,
    strip: TagStripper,
    /// Last seen content hash per source for change detection.
    seen: Mutex<HashMap<Uuid, String>>,
}

impl HtmlAdapter {
    pub fn new(timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent("ranger-ingest/0.1")
            .build()
            .expect("Failed to build HTML HTTP client");
        Self {
            client,
            strip: TagStripper::new(),
            seen: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl SourceAdapter for HtmlAdapter {
    async fn fetch(&self, source: &Source) -> Result<Vec<RawObservation>> {
        let resp = self
            .client
            .get(&source.url)
            .send()
            .await
            .with_context(|| format!("Page fetch failed for {}", source.url))?
            .error_for_status()
            .with_context(|| format!("Page returned error status for {}", source.url))?;
        let html = resp.text().await.context("Failed to read page body")?;

        let text = self.strip.clean(&html);
        if text.trim().is_empty() {
            info!(url = source.url.as_str(), "Empty page after tag stripping");
            return Ok(Vec::new());
        }

        let body_hash = content_hash(&text);
        {
            let mut seen = self.seen.lock().expect("seen map poisoned");
            if seen.get(&source.id) == Some(&body_hash) {
                debug!(url = source.url.as_str(), "Page unchanged since last fetch");
                return Ok(Vec::new());
            }
            seen.insert(source.id, body_hash);
        }

        let headline = self.strip.headline(&html);
        // Stable across refetches of the same article; the headline (or, for
        // headline-less pages, the body hash) keys the page version.
        let external_id = content_hash(&format!(
            "{}|{}",
            source.url,
            headline.clone().unwrap_or_else(|| content_hash(&text))
        ));

        Ok(vec![RawObservation {
            external_id,
            source_url: source.url.clone(),
            raw_text: text,
            published_at: None,
            title: headline,
            produced_at: Utc::now(),
        }])
    }

    fn name(&self) -> &str {
        "html"
    }
}

/// Regex-based HTML-to-text stripping. The extractor handles messy text
/// fine; this only removes scripts, keeps block structure as newlines, and
/// decodes common entities.
pub struct TagStripper {
    script: Regex,
    style: Regex,
    block_close: Regex,
    br: Regex,
    tag: Regex,
    spaces: Regex,
    blank_lines: Regex,
    h1: Regex,
    title: Regex,
}

impl TagStripper {
    pub fn new() -> Self {
        Self {
            script: Regex::new(r"(?is)<script[^>]*>.*?</script>").expect("script regex"),
            style: Regex::new(r"(?is)<style[^>]*>.*?</style>").expect("style regex"),
            block_close: Regex::new(r"(?i)</(p|div|h[1-6]|li|tr|article|section)>")
                .expect("block regex"),
            br: Regex::new(r"(?i)<br\s*/?>").expect("br regex"),
            tag: Regex::new(r"<[^>]+>").expect("tag regex"),
            spaces: Regex::new(r"[ \t]+").expect("spaces regex"),
            blank_lines: Regex::new(r"\n\s*\n").expect("blank regex"),
            h1: Regex::new(r"(?is)<h1[^>]*>(.*?)</h1>").expect("h1 regex"),
            title: Regex::new(r"(?is)<title[^>]*>(.*?)</title>").expect("title regex"),
        }
    }

    pub fn clean(&self, html: &str) -> String {
        let text = self.script.replace_all(html, "");
        let text = self.style.replace_all(&text, "");
        let text = self.block_close.replace_all(&text, "\n");
        let text = self.br.replace_all(&text, "\n");
        let text = self.tag.replace_all(&text, " ");
        let text = decode_entities(&text);
        let text = self.spaces.replace_all(&text, " ");
        let text = self.blank_lines.replace_all(&text, "\n\n");
        text.trim().to_string()
    }

    /// First h1 (falling back to the document title), stripped of markup.
    pub fn headline(&self, html: &str) -> Option<String> {
        let captured = self
            .h1
            .captures(html)
            .or_else(|| self.title.captures(html))?;
        let inner = captured.get(1)?.as_str();
        let text = self.tag.replace_all(inner, " ");
        let text = decode_entities(&text);
        let text = text.trim().to_string();
        (!text.is_empty()).then_some(text)
    }
}

impl Default for TagStripper {
    fn default() -> Self {
        Self::new()
    }
}

fn decode_entities(text: &str) -> String {
    text.replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&nbsp;", " ")
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r#"
        <html>
        <head><title>Local News</title><style>.x{color:red}</style></head>
        <body>
        <script>analytics();</script>
        <article>
            <h1>Two arrested after shots fired in Crystal Lake</h1>
            <p>CRYSTAL LAKE &#39;&ndash;&#39; Police responded around 2:30 a.m.</p>
        </article>
        </body>
        </html>
    "#;

    #[test]
    fn strips_scripts_and_tags() {
        let strip = TagStripper::new();
        let text = strip.clean(PAGE);
        assert!(text.contains("Two arrested after shots fired"));
        assert!(text.contains("Police responded around 2:30 a.m."));
        assert!(!text.contains("analytics"));
        assert!(!text.contains("color:red"));
        assert!(!text.contains('<'));
    }

    #[test]
    fn headline_prefers_h1_over_title() {
        let strip = TagStripper::new();
        assert_eq!(
            strip.headline(PAGE).as_deref(),
            Some("Two arrested after shots fired in Crystal Lake")
        );
        assert_eq!(
            strip
                .headline("<html><head><title>Only Title</title></head></html>")
                .as_deref(),
            Some("Only Title")
        );
        assert_eq!(strip.headline("<p>nothing</p>"), None);
    }
}
