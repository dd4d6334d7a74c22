//! LLM extraction: raw observation text in, candidate incident records out.
//!
//! The model is treated as a stateless function with a strict output schema.
//! Records whose category falls outside the closed set are dropped here and
//! surfaced to the caller so the raw text can be kept for offline inspection.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::warn;

use ranger_ai::Claude;
use ranger_common::{IncidentCategory, SourceType};

/// Context passed alongside the raw text.
#[derive(Debug, Clone)]
pub struct ExtractionHints {
    pub region: String,
    pub source_type: SourceType,
}

/// What the LLM returns for each incident found in the text.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ExtractedIncident {
    /// Specific type, e.g. "shooting", "burglary", "house_fire".
    pub incident_type: String,
    /// One of: violent_crime, property_crime, fire, medical, traffic, drugs,
    /// missing_person, suspicious, other.
    pub category: String,
    /// Street address if mentioned (e.g. "1200 block of Main St"); null when
    /// absent — never invented.
    pub address: Option<String>,
    /// City or municipality name if mentioned.
    pub city: Option<String>,
    /// Incident date/time in RFC 3339, null when the text gives none.
    pub occurred_at: Option<String>,
    /// 1-3 informational, 4-6 notable, 7-8 serious/active, 9-10 life-safety.
    pub urgency_score: i64,
    pub title: String,
    /// 1-2 sentence summary.
    pub description: String,
    /// 0-1 self-reported certainty that this is a real local incident.
    pub extraction_confidence: f64,
}

/// The full extraction response.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct ExtractionResponse {
    #[serde(default)]
    pub incidents: Vec<ExtractedIncident>,
}

/// A validated candidate: closed-set category, parsed timestamp, clamped
/// scores, empty strings normalized to None.
#[derive(Debug, Clone)]
pub struct CandidateIncident {
    pub incident_type: String,
    pub category: IncidentCategory,
    pub address: Option<String>,
    pub city: Option<String>,
    pub occurred_at: Option<DateTime<Utc>>,
    pub urgency_score: i32,
    pub title: String,
    pub description: String,
    pub extraction_confidence: f64,
    /// The raw extracted payload, persisted on the report.
    pub payload: serde_json::Value,
}

/// Result of one extraction call.
#[derive(Debug, Default)]
pub struct ExtractionBatch {
    pub candidates: Vec<CandidateIncident>,
    /// Reasons for records dropped as malformed.
    pub dropped: Vec<String>,
}

#[async_trait]
pub trait IncidentExtractor: Send + Sync {
    async fn extract(&self, raw_text: &str, hints: &ExtractionHints) -> Result<ExtractionBatch>;

    /// Identifier recorded on every report this extractor produces.
    fn model(&self) -> &str;
}

/// Validate the raw LLM response into candidates, dropping records that
/// don't fit the closed schema.
pub fn validate_response(response: ExtractionResponse) -> ExtractionBatch {
    let mut batch = ExtractionBatch::default();

    for incident in response.incidents {
        let category: IncidentCategory = match incident.category.trim().to_lowercase().parse() {
            Ok(c) => c,
            Err(reason) => {
                warn!(
                    incident_type = incident.incident_type.as_str(),
                    reason, "Dropping malformed extraction"
                );
                batch.dropped.push(reason);
                continue;
            }
        };

        let occurred_at = incident
            .occurred_at
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc));

        let payload = serde_json::to_value(&incident).unwrap_or_default();
        batch.candidates.push(CandidateIncident {
            incident_type: incident.incident_type.trim().to_lowercase(),
            category,
            address: non_empty(incident.address),
            city: non_empty(incident.city),
            occurred_at,
            urgency_score: incident.urgency_score.clamp(1, 10) as i32,
            title: incident.title,
            description: incident.description,
            extraction_confidence: incident.extraction_confidence.clamp(0.0, 1.0),
            payload,
        });
    }

    batch
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

// --- Claude implementation ---

const MAX_CONTENT_BYTES: usize = 15_000;

pub struct ClaudeExtractor {
    claude: Claude,
    model: String,
}

impl ClaudeExtractor {
    pub fn new(anthropic_api_key: &str, model: &str) -> Self {
        Self {
            claude: Claude::new(anthropic_api_key, model),
            model: model.to_string(),
        }
    }

    pub fn with_base_url(mut self, url: &str) -> Self {
        self.claude = self.claude.with_base_url(url);
        self
    }
}

fn system_prompt() -> &'static str {
    "You are an incident extraction system for a local intelligence platform.\n\
     Extract ALL distinct incidents from the provided text.\n\
     \n\
     RULES:\n\
     - Extract every distinct incident, even if several appear in one article.\n\
     - Never invent locations or times. If no address is mentioned use\n\
       landmarks or cross streets; otherwise leave address null. If no\n\
       timestamp is mentioned leave occurred_at null. Use null, never an\n\
       empty string.\n\
     - category must be exactly one of: violent_crime, property_crime, fire,\n\
       medical, traffic, drugs, missing_person, suspicious, other.\n\
     - urgency_score: 10 = active threat to life; 8-9 = shooting with\n\
       injuries, major fire; 6-7 = burglary, assault, structure fire;\n\
       4-5 = vehicle theft, drug arrest, minor accident; 1-3 = vandalism,\n\
       suspicious activity, routine traffic. Be conservative; most incidents\n\
       are 3-6.\n\
     - extraction_confidence: 0-1, how certain you are this is a real local\n\
       incident (not speculation, not a different jurisdiction).\n\
     - For HTML-derived text: ignore navigation, ads, and boilerplate.\n\
     - For scanner transcripts: extract only confirmed incidents, not\n\
       \"checking on\" or \"en route\" chatter.\n\
     - If no incidents are found, return an empty list."
}

#[async_trait]
impl IncidentExtractor for ClaudeExtractor {
    async fn extract(&self, raw_text: &str, hints: &ExtractionHints) -> Result<ExtractionBatch> {
        if raw_text.trim().is_empty() {
            return Ok(ExtractionBatch::default());
        }

        // Truncate on a char boundary to stay inside the token budget.
        let content = if raw_text.len() > MAX_CONTENT_BYTES {
            let mut end = MAX_CONTENT_BYTES;
            while !raw_text.is_char_boundary(end) {
                end -= 1;
            }
            &raw_text[..end]
        } else {
            raw_text
        };

        let user_prompt = format!(
            "Source type: {}\nRegion: {}\n\nTEXT TO ANALYZE:\n---\n{}\n---",
            hints.source_type, hints.region, content
        );

        let response: ExtractionResponse =
            self.claude.extract(system_prompt(), user_prompt).await?;
        Ok(validate_response(response))
    }

    fn model(&self) -> &str {
        &self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn incident(category: &str) -> ExtractedIncident {
        ExtractedIncident {
            incident_type: "Shooting".to_string(),
            category: category.to_string(),
            address: Some("100 block of N Main St".to_string()),
            city: Some("Crystal Lake".to_string()),
            occurred_at: Some("2026-07-26T02:31:00Z".to_string()),
            urgency_score: 8,
            title: "Shots fired downtown".to_string(),
            description: "Shots fired near the 100 block of North Main.".to_string(),
            extraction_confidence: 0.8,
        }
    }

    #[test]
    fn valid_record_is_normalized() {
        let batch = validate_response(ExtractionResponse {
            incidents: vec![incident("violent_crime")],
        });
        assert_eq!(batch.candidates.len(), 1);
        assert!(batch.dropped.is_empty());

        let c = &batch.candidates[0];
        assert_eq!(c.incident_type, "shooting");
        assert_eq!(c.category, IncidentCategory::ViolentCrime);
        assert!(c.occurred_at.is_some());
    }

    #[test]
    fn category_outside_closed_set_is_dropped() {
        let batch = validate_response(ExtractionResponse {
            incidents: vec![incident("arson"), incident("fire")],
        });
        assert_eq!(batch.candidates.len(), 1);
        assert_eq!(batch.dropped.len(), 1);
        assert_eq!(batch.candidates[0].category, IncidentCategory::Fire);
    }

    #[test]
    fn empty_strings_become_nulls_and_scores_clamp() {
        let mut record = incident("other");
        record.address = Some("  ".to_string());
        record.occurred_at = Some("not a date".to_string());
        record.urgency_score = 40;
        record.extraction_confidence = 1.7;

        let batch = validate_response(ExtractionResponse {
            incidents: vec![record],
        });
        let c = &batch.candidates[0];
        assert_eq!(c.address, None);
        assert_eq!(c.occurred_at, None);
        assert_eq!(c.urgency_score, 10);
        assert!((c.extraction_confidence - 1.0).abs() < 1e-9);
    }
}
