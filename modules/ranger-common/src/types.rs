use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// --- Geo Types ---

/// How a location was resolved, from best to worst.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum LocationResolution {
    Parcel,
    Block,
    Centroid,
    Unknown,
}

impl std::fmt::Display for LocationResolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LocationResolution::Parcel => write!(f, "parcel"),
            LocationResolution::Block => write!(f, "block"),
            LocationResolution::Centroid => write!(f, "centroid"),
            LocationResolution::Unknown => write!(f, "unknown"),
        }
    }
}

impl std::str::FromStr for LocationResolution {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "parcel" => Ok(LocationResolution::Parcel),
            "block" => Ok(LocationResolution::Block),
            "centroid" => Ok(LocationResolution::Centroid),
            "unknown" => Ok(LocationResolution::Unknown),
            other => Err(format!("unknown location resolution: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

/// Haversine great-circle distance between two lat/lng points in meters.
pub fn haversine_m(lat1: f64, lng1: f64, lat2: f64, lng2: f64) -> f64 {
    const EARTH_RADIUS_M: f64 = 6_371_000.0;
    let d_lat = (lat2 - lat1).to_radians();
    let d_lng = (lng2 - lng1).to_radians();
    let lat1_r = lat1.to_radians();
    let lat2_r = lat2.to_radians();

    let a = (d_lat / 2.0).sin().powi(2) + lat1_r.cos() * lat2_r.cos() * (d_lng / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().asin();
    EARTH_RADIUS_M * c
}

impl GeoPoint {
    pub fn distance_m(&self, other: &GeoPoint) -> f64 {
        haversine_m(self.lat, self.lng, other.lat, other.lng)
    }
}

// --- Enums ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    Html,
    Rss,
    Api,
    Audio,
    Manual,
}

impl std::fmt::Display for SourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceType::Html => write!(f, "html"),
            SourceType::Rss => write!(f, "rss"),
            SourceType::Api => write!(f, "api"),
            SourceType::Audio => write!(f, "audio"),
            SourceType::Manual => write!(f, "manual"),
        }
    }
}

impl std::str::FromStr for SourceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "html" => Ok(SourceType::Html),
            "rss" => Ok(SourceType::Rss),
            "api" => Ok(SourceType::Api),
            "audio" => Ok(SourceType::Audio),
            "manual" => Ok(SourceType::Manual),
            other => Err(format!("unknown source type: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum SourceCategory {
    News,
    Crime,
    Fire,
    Permits,
    Business,
}

impl std::fmt::Display for SourceCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceCategory::News => write!(f, "news"),
            SourceCategory::Crime => write!(f, "crime"),
            SourceCategory::Fire => write!(f, "fire"),
            SourceCategory::Permits => write!(f, "permits"),
            SourceCategory::Business => write!(f, "business"),
        }
    }
}

impl std::str::FromStr for SourceCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "news" => Ok(SourceCategory::News),
            "crime" => Ok(SourceCategory::Crime),
            "fire" => Ok(SourceCategory::Fire),
            "permits" => Ok(SourceCategory::Permits),
            "business" => Ok(SourceCategory::Business),
            other => Err(format!("unknown source category: {other}")),
        }
    }
}

/// Closed category set assigned by the extraction engine.
/// Extractor output outside this set is a malformed extraction, not "other".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum IncidentCategory {
    ViolentCrime,
    PropertyCrime,
    Fire,
    Medical,
    Traffic,
    Drugs,
    MissingPerson,
    Suspicious,
    Other,
}

impl IncidentCategory {
    /// All categories in stable display order (rollup buckets iterate this).
    pub const ALL: [IncidentCategory; 9] = [
        IncidentCategory::ViolentCrime,
        IncidentCategory::PropertyCrime,
        IncidentCategory::Fire,
        IncidentCategory::Medical,
        IncidentCategory::Traffic,
        IncidentCategory::Drugs,
        IncidentCategory::MissingPerson,
        IncidentCategory::Suspicious,
        IncidentCategory::Other,
    ];
}

impl std::fmt::Display for IncidentCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IncidentCategory::ViolentCrime => write!(f, "violent_crime"),
            IncidentCategory::PropertyCrime => write!(f, "property_crime"),
            IncidentCategory::Fire => write!(f, "fire"),
            IncidentCategory::Medical => write!(f, "medical"),
            IncidentCategory::Traffic => write!(f, "traffic"),
            IncidentCategory::Drugs => write!(f, "drugs"),
            IncidentCategory::MissingPerson => write!(f, "missing_person"),
            IncidentCategory::Suspicious => write!(f, "suspicious"),
            IncidentCategory::Other => write!(f, "other"),
        }
    }
}

impl std::str::FromStr for IncidentCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "violent_crime" => Ok(IncidentCategory::ViolentCrime),
            "property_crime" => Ok(IncidentCategory::PropertyCrime),
            "fire" => Ok(IncidentCategory::Fire),
            "medical" => Ok(IncidentCategory::Medical),
            "traffic" => Ok(IncidentCategory::Traffic),
            "drugs" => Ok(IncidentCategory::Drugs),
            "missing_person" => Ok(IncidentCategory::MissingPerson),
            "suspicious" => Ok(IncidentCategory::Suspicious),
            "other" => Ok(IncidentCategory::Other),
            other => Err(format!("category outside closed set: {other}")),
        }
    }
}

/// Lifetime state of a raw report's dedup processing.
/// Transitions only along pending -> (matched | new_incident | rejected).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DedupStatus {
    Pending,
    Matched,
    NewIncident,
    Rejected,
}

impl std::fmt::Display for DedupStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DedupStatus::Pending => write!(f, "pending"),
            DedupStatus::Matched => write!(f, "matched"),
            DedupStatus::NewIncident => write!(f, "new_incident"),
            DedupStatus::Rejected => write!(f, "rejected"),
        }
    }
}

impl std::str::FromStr for DedupStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(DedupStatus::Pending),
            "matched" => Ok(DedupStatus::Matched),
            "new_incident" => Ok(DedupStatus::NewIncident),
            "rejected" => Ok(DedupStatus::Rejected),
            other => Err(format!("unknown dedup status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewStatus {
    AutoPublished,
    Unverified,
    NeedsReview,
    Approved,
    Rejected,
}

impl ReviewStatus {
    /// Statuses visible on the public read surface.
    pub fn is_public(&self) -> bool {
        matches!(
            self,
            ReviewStatus::AutoPublished | ReviewStatus::Unverified | ReviewStatus::Approved
        )
    }

    /// Human decisions are never overwritten by automatic recompute.
    pub fn is_operator_decision(&self) -> bool {
        matches!(self, ReviewStatus::Approved | ReviewStatus::Rejected)
    }
}

impl std::fmt::Display for ReviewStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReviewStatus::AutoPublished => write!(f, "auto_published"),
            ReviewStatus::Unverified => write!(f, "unverified"),
            ReviewStatus::NeedsReview => write!(f, "needs_review"),
            ReviewStatus::Approved => write!(f, "approved"),
            ReviewStatus::Rejected => write!(f, "rejected"),
        }
    }
}

impl std::str::FromStr for ReviewStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto_published" => Ok(ReviewStatus::AutoPublished),
            "unverified" => Ok(ReviewStatus::Unverified),
            "needs_review" => Ok(ReviewStatus::NeedsReview),
            "approved" => Ok(ReviewStatus::Approved),
            "rejected" => Ok(ReviewStatus::Rejected),
            other => Err(format!("unknown review status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncidentStatus {
    Active,
    Resolved,
    Retracted,
}

impl std::fmt::Display for IncidentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IncidentStatus::Active => write!(f, "active"),
            IncidentStatus::Resolved => write!(f, "resolved"),
            IncidentStatus::Retracted => write!(f, "retracted"),
        }
    }
}

impl std::str::FromStr for IncidentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(IncidentStatus::Active),
            "resolved" => Ok(IncidentStatus::Resolved),
            "retracted" => Ok(IncidentStatus::Retracted),
            other => Err(format!("unknown incident status: {other}")),
        }
    }
}

// --- Durable entities ---

/// A configured data origin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Source {
    pub id: Uuid,
    pub name: String,
    pub source_type: SourceType,
    pub url: String,
    pub region: String,
    pub category: SourceCategory,
    /// Municipality this source covers, when narrower than the region.
    pub municipality: Option<String>,
    /// Opaque per-adapter settings (poll interval, selectors, item pointers).
    pub config: serde_json::Value,
    pub is_active: bool,
    pub reliability_score: f64,
    pub last_fetched_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// A single raw observation from a single source. Provenance is permanent:
/// reports are never merged or destroyed, only linked.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncidentReport {
    pub id: Uuid,
    pub source_id: Uuid,
    pub external_id: String,
    pub source_url: String,
    pub raw_text: String,
    pub extracted: serde_json::Value,
    pub incident_type: String,
    pub category: IncidentCategory,
    pub address: Option<String>,
    pub city: Option<String>,
    pub location: Option<GeoPoint>,
    pub occurred_at: Option<DateTime<Utc>>,
    pub ingested_at: DateTime<Utc>,
    pub extraction_model: String,
    pub extraction_confidence: f64,
    pub source_type: SourceType,
    pub dedup_status: DedupStatus,
    pub dedup_processed_at: Option<DateTime<Utc>>,
    pub incident_id: Option<Uuid>,
}

impl IncidentReport {
    /// Event time used for the dedup window: occurred_at when known,
    /// otherwise ingestion time. Storage keeps occurred_at null so callers
    /// can detect imprecise timing.
    pub fn dedup_time(&self) -> DateTime<Utc> {
        self.occurred_at.unwrap_or(self.ingested_at)
    }
}

/// A canonical, deduplicated occurrence. report_count, source_types and
/// confidence_score are derived from the linked report set and recomputed
/// whenever that set changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Incident {
    pub id: Uuid,
    pub incident_type: String,
    pub category: IncidentCategory,
    pub urgency_score: i32,
    pub location: Option<GeoPoint>,
    pub location_resolution: LocationResolution,
    pub location_confidence: f64,
    pub address: Option<String>,
    pub city: Option<String>,
    pub region: String,
    pub occurred_at: Option<DateTime<Utc>>,
    pub reported_at: DateTime<Utc>,
    pub title: String,
    pub description: String,
    pub report_count: i64,
    pub source_types: Vec<SourceType>,
    pub confidence_score: f64,
    pub review_status: ReviewStatus,
    pub reviewed_at: Option<DateTime<Utc>>,
    pub reviewed_by: Option<String>,
    pub status: IncidentStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Incident {
    pub fn dedup_time(&self) -> DateTime<Utc> {
        self.occurred_at.unwrap_or(self.reported_at)
    }
}

/// Cached reference geometry for block-level geocoding. Read-only to the
/// pipeline; loaded once per region from a centerline import.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreetCenterline {
    pub id: Uuid,
    pub region: String,
    pub street_name: String,
    pub street_name_normalized: String,
    pub from_address: i32,
    pub to_address: i32,
    pub city: Option<String>,
    /// Ordered polyline vertices.
    pub geometry: Vec<GeoPoint>,
}

impl StreetCenterline {
    /// Point halfway along the polyline by accumulated length.
    pub fn midpoint(&self) -> Option<GeoPoint> {
        if self.geometry.is_empty() {
            return None;
        }
        if self.geometry.len() == 1 {
            return Some(self.geometry[0]);
        }

        let total: f64 = self
            .geometry
            .windows(2)
            .map(|w| w[0].distance_m(&w[1]))
            .sum();
        if total == 0.0 {
            return Some(self.geometry[0]);
        }

        let mut remaining = total / 2.0;
        for w in self.geometry.windows(2) {
            let seg = w[0].distance_m(&w[1]);
            if remaining <= seg {
                let t = remaining / seg;
                return Some(GeoPoint {
                    lat: w[0].lat + (w[1].lat - w[0].lat) * t,
                    lng: w[0].lng + (w[1].lng - w[0].lng) * t,
                });
            }
            remaining -= seg;
        }
        self.geometry.last().copied()
    }
}

/// Aggregate snapshot for one week, per municipality or region-wide
/// (municipality = None). Upserted idempotently by the rollup job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeeklyRollup {
    pub id: Uuid,
    pub week_start: chrono::NaiveDate,
    pub municipality: Option<String>,
    pub incident_count: i64,
    pub incidents_by_category: serde_json::Value,
    pub news_count: i64,
    pub news_by_category: serde_json::Value,
    /// Integer percent change vs the prior week.
    pub incident_trend: i32,
    pub summary_text: String,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn haversine_zero_for_same_point() {
        assert_eq!(haversine_m(42.2411, -88.3162, 42.2411, -88.3162), 0.0);
    }

    #[test]
    fn haversine_known_distance() {
        // Crystal Lake to McHenry centroids, ~11 km.
        let d = haversine_m(42.2411, -88.3162, 42.3336, -88.2668);
        assert!((d - 11_000.0).abs() < 1_000.0, "distance was {d}");
    }

    #[test]
    fn enum_round_trips() {
        for s in ["parcel", "block", "centroid", "unknown"] {
            let r: LocationResolution = s.parse().unwrap();
            assert_eq!(r.to_string(), s);
        }
        for s in ["pending", "matched", "new_incident", "rejected"] {
            let d: DedupStatus = s.parse().unwrap();
            assert_eq!(d.to_string(), s);
        }
        for s in [
            "auto_published",
            "unverified",
            "needs_review",
            "approved",
            "rejected",
        ] {
            let r: ReviewStatus = s.parse().unwrap();
            assert_eq!(r.to_string(), s);
        }
    }

    #[test]
    fn category_rejects_values_outside_closed_set() {
        assert!("arson".parse::<IncidentCategory>().is_err());
        assert!("violent_crime".parse::<IncidentCategory>().is_ok());
    }

    #[test]
    fn centerline_midpoint_of_straight_segment() {
        let line = StreetCenterline {
            id: Uuid::new_v4(),
            region: "mchenry_county".into(),
            street_name: "N MAIN ST".into(),
            street_name_normalized: "n main".into(),
            from_address: 1,
            to_address: 199,
            city: Some("Crystal Lake".into()),
            geometry: vec![
                GeoPoint { lat: 42.0, lng: -88.0 },
                GeoPoint { lat: 42.002, lng: -88.0 },
            ],
        };
        let mid = line.midpoint().unwrap();
        assert!((mid.lat - 42.001).abs() < 1e-9);
        assert!((mid.lng + 88.0).abs() < 1e-9);
    }
}
