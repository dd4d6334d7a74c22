//! Test harness: the real pipeline wired to the in-memory store with a
//! scripted extractor and parcel geocoder. Observation text is the JSON the
//! fake extractor returns, so scenarios control extraction output exactly.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use ranger_common::{GeoPoint, Source, SourceCategory, SourceType};
use ranger_ingest::adapters::RawObservation;
use ranger_ingest::dedup::{DedupConfig, Deduplicator};
use ranger_ingest::extractor::{
    validate_response, ExtractionBatch, ExtractionHints, ExtractionResponse, IncidentExtractor,
};
use ranger_ingest::geocoder::{CentroidTable, Geocoder, ParcelGeocoder};
use ranger_ingest::pipeline::{Ingestor, ObservationOutcome};
use ranger_ingest::rate_limit::{RateLimits, TokenBucket};
use ranger_ingest::run_log::RunLog;
use ranger_store::{IncidentStore, MemoryStore, SourceSpec};

pub const REGION: &str = "mchenry_county";

/// Extractor that deserializes the observation text as its own response.
pub struct ScriptedExtractor;

#[async_trait]
impl IncidentExtractor for ScriptedExtractor {
    async fn extract(&self, raw_text: &str, _hints: &ExtractionHints) -> Result<ExtractionBatch> {
        let response: ExtractionResponse = serde_json::from_str(raw_text)?;
        Ok(validate_response(response))
    }

    fn model(&self) -> &str {
        "scripted-extractor"
    }
}

/// Parcel geocoder answering from a fixed address map.
pub struct MapParcelGeocoder {
    entries: HashMap<String, GeoPoint>,
}

#[async_trait]
impl ParcelGeocoder for MapParcelGeocoder {
    async fn lookup(&self, address: &str, _city: Option<&str>) -> Result<Option<GeoPoint>> {
        Ok(self.entries.get(address).copied())
    }
}

pub struct Harness {
    pub store: Arc<dyn IncidentStore>,
    pub ingestor: Ingestor,
    pub log: Mutex<RunLog>,
}

impl Harness {
    pub fn new(parcel_map: &[(&str, f64, f64)]) -> Self {
        let store: Arc<dyn IncidentStore> = Arc::new(MemoryStore::new());

        let entries = parcel_map
            .iter()
            .map(|(addr, lat, lng)| {
                (
                    addr.to_string(),
                    GeoPoint {
                        lat: *lat,
                        lng: *lng,
                    },
                )
            })
            .collect();
        let geocoder = Geocoder::new(
            Some(Arc::new(MapParcelGeocoder { entries })),
            store.clone(),
            CentroidTable::mchenry_county(),
        );

        let dedup = Deduplicator::new(store.clone(), DedupConfig::default());
        let limits = Arc::new(RateLimits {
            llm: TokenBucket::new(10_000.0, 10_000.0),
            geocoder: TokenBucket::new(10_000.0, 10_000.0),
        });

        let ingestor = Ingestor::new(
            store.clone(),
            Arc::new(ScriptedExtractor),
            geocoder,
            dedup,
            limits,
            REGION,
            std::env::temp_dir().join("ranger-harness").as_path(),
        );

        Self {
            store,
            ingestor,
            log: Mutex::new(RunLog::new(REGION)),
        }
    }

    pub async fn source(
        &self,
        name: &str,
        source_type: SourceType,
        category: SourceCategory,
    ) -> Source {
        self.store
            .upsert_source(&SourceSpec {
                name: name.to_string(),
                source_type,
                url: format!("https://example.test/{name}"),
                region: REGION.to_string(),
                category,
                municipality: None,
                config: serde_json::json!({}),
            })
            .await
            .expect("upsert source")
    }

    pub async fn ingest(&self, source: &Source, obs: &RawObservation) -> ObservationOutcome {
        self.ingestor
            .ingest_observation(source, obs, &self.log)
            .await
            .expect("ingest observation")
    }
}

/// An observation whose text scripts one extracted incident.
#[allow(clippy::too_many_arguments)]
pub fn observation(
    external_id: &str,
    incident_type: &str,
    category: &str,
    address: Option<&str>,
    city: Option<&str>,
    occurred_at: Option<DateTime<Utc>>,
    confidence: f64,
) -> RawObservation {
    let body = serde_json::json!({
        "incidents": [{
            "incident_type": incident_type,
            "category": category,
            "address": address,
            "city": city,
            "occurred_at": occurred_at.map(|t| t.to_rfc3339()),
            "urgency_score": 7,
            "title": format!("{incident_type} reported"),
            "description": format!("A {incident_type} was reported."),
            "extraction_confidence": confidence,
        }]
    });
    RawObservation {
        external_id: external_id.to_string(),
        source_url: "https://example.test/article".to_string(),
        raw_text: body.to_string(),
        published_at: None,
        title: None,
        produced_at: Utc::now(),
    }
}

pub fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
    chrono::NaiveDate::from_ymd_opt(y, mo, d)
        .unwrap()
        .and_hms_opt(h, mi, 0)
        .unwrap()
        .and_utc()
}
