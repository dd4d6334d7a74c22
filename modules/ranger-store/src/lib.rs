//! Durable data model behind the ingestion pipeline.
//!
//! The [`IncidentStore`] trait is the seam between pipeline logic and
//! persistence: [`pg::PgStore`] is the production backend, [`memory::MemoryStore`]
//! backs the test harness. Both guarantee the same atomicity contract: a
//! report is either fully pending or fully linked with the incident's derived
//! fields recomputed — never in between.

pub mod memory;
pub mod pg;

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use uuid::Uuid;

use ranger_common::{
    GeoPoint, Incident, IncidentCategory, IncidentReport, LocationResolution, Result, Source,
    SourceCategory, SourceType, StreetCenterline, WeeklyRollup,
};

pub use memory::MemoryStore;
pub use pg::PgStore;

/// A source entry from the configuration document, upserted by url.
#[derive(Debug, Clone)]
pub struct SourceSpec {
    pub name: String,
    pub source_type: SourceType,
    pub url: String,
    pub region: String,
    pub category: SourceCategory,
    pub municipality: Option<String>,
    pub config: serde_json::Value,
}

/// A raw observation after extraction and geocoding, ready to persist.
#[derive(Debug, Clone)]
pub struct NewReport {
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
    pub extraction_model: String,
    pub extraction_confidence: f64,
    pub source_type: SourceType,
}

/// Outcome of an idempotent report insert: a `(source_id, external_id)`
/// collision means the observation was already ingested and is treated as
/// success.
#[derive(Debug, Clone)]
pub enum ReportInsert {
    Inserted(IncidentReport),
    Duplicate,
}

/// Seed values for a canonical incident materialised from an unmatched report.
#[derive(Debug, Clone)]
pub struct NewIncident {
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
    pub title: String,
    pub description: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviewAction {
    Approve,
    Reject,
}

/// Read-side incident filter (the `GET /incidents` contract).
#[derive(Debug, Clone, Default)]
pub struct IncidentFilter {
    pub region: Option<String>,
    pub category: Option<IncidentCategory>,
    pub city: Option<String>,
    pub min_urgency: Option<i32>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    /// Restrict to these review statuses; None means no restriction.
    pub review_statuses: Option<Vec<ranger_common::ReviewStatus>>,
    pub limit: i64,
}

/// Rollup values computed by the rollup engine; the store keys the upsert by
/// `(week_start, municipality)` and preserves id/created_at on regeneration.
#[derive(Debug, Clone)]
pub struct NewRollup {
    pub week_start: NaiveDate,
    pub municipality: Option<String>,
    pub incident_count: i64,
    pub incidents_by_category: serde_json::Value,
    pub news_count: i64,
    pub news_by_category: serde_json::Value,
    pub incident_trend: i32,
    pub summary_text: String,
}

#[async_trait]
pub trait IncidentStore: Send + Sync {
    // --- Sources ---

    /// Upsert a configured source by url within its region, reactivating it
    /// if previously deactivated.
    async fn upsert_source(&self, spec: &SourceSpec) -> Result<Source>;

    async fn active_sources(&self) -> Result<Vec<Source>>;

    async fn mark_fetched(&self, source_id: Uuid, at: DateTime<Utc>) -> Result<()>;

    async fn set_source_active(&self, source_id: Uuid, active: bool) -> Result<()>;

    // --- Reports ---

    /// Idempotent insert keyed by `(source_id, external_id)`.
    async fn insert_report(&self, report: NewReport) -> Result<ReportInsert>;

    async fn report(&self, id: Uuid) -> Result<Option<IncidentReport>>;

    /// Reports still awaiting dedup (from a cancelled or deferred cycle),
    /// oldest first.
    async fn pending_reports(&self, limit: i64) -> Result<Vec<IncidentReport>>;

    /// All reports referencing the incident, including rejected ones
    /// (provenance is permanent).
    async fn reports_for_incident(&self, incident_id: Uuid) -> Result<Vec<IncidentReport>>;

    // --- Incidents ---

    async fn incident(&self, id: Uuid) -> Result<Option<Incident>>;

    /// Candidate incidents within `radius_m` of `point` whose event time is
    /// within `window` of `around`. Missing `occurred_at` falls back to
    /// `reported_at` on the incident side.
    async fn incidents_near(
        &self,
        point: GeoPoint,
        radius_m: f64,
        around: DateTime<Utc>,
        window: Duration,
    ) -> Result<Vec<Incident>>;

    /// Materialise a canonical incident from an unmatched report: create the
    /// incident, mark the report `new_incident`, and set the derived fields
    /// and review status — all atomically.
    async fn create_incident_for_report(
        &self,
        report_id: Uuid,
        incident: NewIncident,
    ) -> Result<Incident>;

    /// Link a pending report to an existing incident and recompute the
    /// incident's derived fields and review status in the same serialized
    /// step. The report transitions `pending -> matched` exactly once.
    async fn link_report_to_incident(
        &self,
        report_id: Uuid,
        incident_id: Uuid,
    ) -> Result<Incident>;

    /// Operator decision. Approve stamps `reviewed_at`/`reviewed_by`; reject
    /// additionally cascades `dedup_status = rejected` onto every linked
    /// report.
    async fn review_incident(
        &self,
        incident_id: Uuid,
        action: ReviewAction,
        reviewed_by: &str,
    ) -> Result<Incident>;

    async fn query_incidents(&self, filter: &IncidentFilter) -> Result<Vec<Incident>>;

    /// Incidents in the review queue, oldest first, with their reports for
    /// operator context.
    async fn review_queue(
        &self,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<(Incident, Vec<IncidentReport>)>>;

    /// Incidents in a region whose event time falls in `[from, to)`.
    async fn incidents_between(
        &self,
        region: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Incident>>;

    /// Reports from news-category sources in a region over `[from, to)`.
    async fn news_reports_between(
        &self,
        region: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<IncidentReport>>;

    // --- Rollups ---

    async fn upsert_rollup(&self, rollup: NewRollup) -> Result<WeeklyRollup>;

    /// Rollup rows for a municipality (None = region-wide rows), most recent
    /// week first.
    async fn rollups(
        &self,
        municipality: Option<&str>,
        weeks: i64,
    ) -> Result<Vec<WeeklyRollup>>;

    // --- Centerlines ---

    async fn insert_centerlines(&self, lines: Vec<StreetCenterline>) -> Result<u64>;

    /// Centerlines in a region whose normalized name contains `street` and
    /// whose address range spans `block_number`, in a stable order.
    async fn centerlines_spanning(
        &self,
        region: &str,
        street: &str,
        block_number: i32,
    ) -> Result<Vec<StreetCenterline>>;
}
