//! Postgres persistence. Row structs keep store-level types (strings for
//! enums, paired lat/lng columns) and convert to domain types at the edge.
//!
//! Every link/recompute path runs in one transaction holding a per-incident
//! advisory lock, so concurrent writes to the same canonical incident are
//! serialized and readers always see a consistent (derived, review_status)
//! pair.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use tracing::info;
use uuid::Uuid;

use ranger_common::{
    next_review_status, proposed_status, quality, GeoPoint, Incident, IncidentReport, RangerError,
    Result, Source, SourceType, StreetCenterline, WeeklyRollup,
};

use crate::{
    IncidentFilter, IncidentStore, NewIncident, NewReport, NewRollup, ReportInsert, ReviewAction,
    SourceSpec,
};

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run the embedded SQL migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| RangerError::Database(e.to_string()))?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Recompute an incident's derived fields and review status from its
    /// active linked reports, inside the caller's transaction. The caller
    /// must already hold the incident's advisory lock.
    async fn recompute_in_tx(
        tx: &mut Transaction<'_, Postgres>,
        incident_id: Uuid,
    ) -> Result<Incident> {
        let linked: Vec<(f64, String)> = sqlx::query_as(
            r#"
            SELECT extraction_confidence, source_type FROM incident_reports
            WHERE incident_id = $1 AND dedup_status IN ('matched', 'new_incident')
            "#,
        )
        .bind(incident_id)
        .fetch_all(&mut **tx)
        .await
        .map_err(db_err)?;

        let pairs: Vec<(f64, SourceType)> = linked
            .into_iter()
            .filter_map(|(ec, st)| st.parse().ok().map(|st| (ec, st)))
            .collect();
        let derived = quality::derive_incident_state(&pairs);

        let current: String =
            sqlx::query_scalar("SELECT review_status FROM incidents WHERE id = $1")
                .bind(incident_id)
                .fetch_optional(&mut **tx)
                .await
                .map_err(db_err)?
                .ok_or(RangerError::IncidentNotFound(incident_id))?;
        let current = current.parse().map_err(RangerError::Database)?;
        let status = next_review_status(current, derived.confidence_score);

        let source_types: Vec<String> =
            derived.source_types.iter().map(|s| s.to_string()).collect();

        let row: IncidentRow = sqlx::query_as(
            r#"
            UPDATE incidents
            SET report_count = $2,
                source_types = $3,
                confidence_score = $4,
                review_status = $5,
                updated_at = now()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(incident_id)
        .bind(derived.report_count)
        .bind(&source_types)
        .bind(derived.confidence_score)
        .bind(status.to_string())
        .fetch_one(&mut **tx)
        .await
        .map_err(db_err)?;

        row.try_into()
    }

    async fn lock_incident(
        tx: &mut Transaction<'_, Postgres>,
        incident_id: Uuid,
    ) -> Result<()> {
        sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
            .bind(incident_id.to_string())
            .execute(&mut **tx)
            .await
            .map_err(db_err)?;
        Ok(())
    }
}

fn db_err(e: sqlx::Error) -> RangerError {
    RangerError::Database(e.to_string())
}

// --- Row structs ---

#[derive(Debug, sqlx::FromRow)]
struct SourceRow {
    id: Uuid,
    name: String,
    source_type: String,
    url: String,
    region: String,
    category: String,
    municipality: Option<String>,
    config: serde_json::Value,
    is_active: bool,
    reliability_score: f64,
    last_fetched_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl TryFrom<SourceRow> for Source {
    type Error = RangerError;

    fn try_from(r: SourceRow) -> Result<Self> {
        Ok(Source {
            id: r.id,
            name: r.name,
            source_type: r.source_type.parse().map_err(RangerError::Database)?,
            url: r.url,
            region: r.region,
            category: r.category.parse().map_err(RangerError::Database)?,
            municipality: r.municipality,
            config: r.config,
            is_active: r.is_active,
            reliability_score: r.reliability_score,
            last_fetched_at: r.last_fetched_at,
            created_at: r.created_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct ReportRow {
    id: Uuid,
    source_id: Uuid,
    external_id: String,
    source_url: String,
    raw_text: String,
    extracted: serde_json::Value,
    incident_type: String,
    category: String,
    address: Option<String>,
    city: Option<String>,
    lat: Option<f64>,
    lng: Option<f64>,
    occurred_at: Option<DateTime<Utc>>,
    ingested_at: DateTime<Utc>,
    extraction_model: String,
    extraction_confidence: f64,
    source_type: String,
    dedup_status: String,
    dedup_processed_at: Option<DateTime<Utc>>,
    incident_id: Option<Uuid>,
}

impl TryFrom<ReportRow> for IncidentReport {
    type Error = RangerError;

    fn try_from(r: ReportRow) -> Result<Self> {
        Ok(IncidentReport {
            id: r.id,
            source_id: r.source_id,
            external_id: r.external_id,
            source_url: r.source_url,
            raw_text: r.raw_text,
            extracted: r.extracted,
            incident_type: r.incident_type,
            category: r.category.parse().map_err(RangerError::Database)?,
            address: r.address,
            city: r.city,
            location: point_from(r.lat, r.lng),
            occurred_at: r.occurred_at,
            ingested_at: r.ingested_at,
            extraction_model: r.extraction_model,
            extraction_confidence: r.extraction_confidence,
            source_type: r.source_type.parse().map_err(RangerError::Database)?,
            dedup_status: r.dedup_status.parse().map_err(RangerError::Database)?,
            dedup_processed_at: r.dedup_processed_at,
            incident_id: r.incident_id,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct IncidentRow {
    id: Uuid,
    incident_type: String,
    category: String,
    urgency_score: i32,
    lat: Option<f64>,
    lng: Option<f64>,
    location_resolution: String,
    location_confidence: f64,
    address: Option<String>,
    city: Option<String>,
    region: String,
    occurred_at: Option<DateTime<Utc>>,
    reported_at: DateTime<Utc>,
    title: String,
    description: String,
    report_count: i64,
    source_types: Vec<String>,
    confidence_score: f64,
    review_status: String,
    reviewed_at: Option<DateTime<Utc>>,
    reviewed_by: Option<String>,
    status: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<IncidentRow> for Incident {
    type Error = RangerError;

    fn try_from(r: IncidentRow) -> Result<Self> {
        Ok(Incident {
            id: r.id,
            incident_type: r.incident_type,
            category: r.category.parse().map_err(RangerError::Database)?,
            urgency_score: r.urgency_score,
            location: point_from(r.lat, r.lng),
            location_resolution: r
                .location_resolution
                .parse()
                .map_err(RangerError::Database)?,
            location_confidence: r.location_confidence,
            address: r.address,
            city: r.city,
            region: r.region,
            occurred_at: r.occurred_at,
            reported_at: r.reported_at,
            title: r.title,
            description: r.description,
            report_count: r.report_count,
            source_types: r
                .source_types
                .iter()
                .filter_map(|s| s.parse().ok())
                .collect(),
            confidence_score: r.confidence_score,
            review_status: r.review_status.parse().map_err(RangerError::Database)?,
            reviewed_at: r.reviewed_at,
            reviewed_by: r.reviewed_by,
            status: r.status.parse().map_err(RangerError::Database)?,
            created_at: r.created_at,
            updated_at: r.updated_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct CenterlineRow {
    id: Uuid,
    region: String,
    street_name: String,
    street_name_normalized: String,
    from_address: i32,
    to_address: i32,
    city: Option<String>,
    geometry: serde_json::Value,
}

impl TryFrom<CenterlineRow> for StreetCenterline {
    type Error = RangerError;

    fn try_from(r: CenterlineRow) -> Result<Self> {
        let geometry: Vec<GeoPoint> = serde_json::from_value(r.geometry)
            .map_err(|e| RangerError::Database(format!("bad centerline geometry: {e}")))?;
        Ok(StreetCenterline {
            id: r.id,
            region: r.region,
            street_name: r.street_name,
            street_name_normalized: r.street_name_normalized,
            from_address: r.from_address,
            to_address: r.to_address,
            city: r.city,
            geometry,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct RollupRow {
    id: Uuid,
    week_start: NaiveDate,
    municipality: Option<String>,
    incident_count: i64,
    incidents_by_category: serde_json::Value,
    news_count: i64,
    news_by_category: serde_json::Value,
    incident_trend: i32,
    summary_text: String,
    created_at: DateTime<Utc>,
}

impl From<RollupRow> for WeeklyRollup {
    fn from(r: RollupRow) -> Self {
        WeeklyRollup {
            id: r.id,
            week_start: r.week_start,
            municipality: r.municipality,
            incident_count: r.incident_count,
            incidents_by_category: r.incidents_by_category,
            news_count: r.news_count,
            news_by_category: r.news_by_category,
            incident_trend: r.incident_trend,
            summary_text: r.summary_text,
            created_at: r.created_at,
        }
    }
}

fn point_from(lat: Option<f64>, lng: Option<f64>) -> Option<GeoPoint> {
    match (lat, lng) {
        (Some(lat), Some(lng)) => Some(GeoPoint { lat, lng }),
        _ => None,
    }
}

/// Bounding box around a point, in degrees, for the index prefilter.
fn bbox(point: GeoPoint, radius_m: f64) -> (f64, f64, f64, f64) {
    const M_PER_DEG_LAT: f64 = 111_320.0;
    let d_lat = radius_m / M_PER_DEG_LAT;
    let d_lng = radius_m / (M_PER_DEG_LAT * point.lat.to_radians().cos().abs().max(1e-6));
    (
        point.lat - d_lat,
        point.lat + d_lat,
        point.lng - d_lng,
        point.lng + d_lng,
    )
}

#[async_trait::async_trait]
impl IncidentStore for PgStore {
    async fn upsert_source(&self, spec: &SourceSpec) -> Result<Source> {
        // An inactive row with the same (region, url) is reactivated rather
        // than duplicated; the partial unique index only covers active rows.
        let existing: Option<Uuid> =
            sqlx::query_scalar("SELECT id FROM sources WHERE region = $1 AND url = $2")
                .bind(&spec.region)
                .bind(&spec.url)
                .fetch_optional(&self.pool)
                .await
                .map_err(db_err)?;

        let row: SourceRow = match existing {
            Some(id) => sqlx::query_as(
                r#"
                UPDATE sources
                SET name = $2, source_type = $3, category = $4, municipality = $5,
                    config = $6, is_active = TRUE
                WHERE id = $1
                RETURNING *
                "#,
            )
            .bind(id)
            .bind(&spec.name)
            .bind(spec.source_type.to_string())
            .bind(spec.category.to_string())
            .bind(&spec.municipality)
            .bind(&spec.config)
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?,
            None => sqlx::query_as(
                r#"
                INSERT INTO sources (name, source_type, url, region, category, municipality, config)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                RETURNING *
                "#,
            )
            .bind(&spec.name)
            .bind(spec.source_type.to_string())
            .bind(&spec.url)
            .bind(&spec.region)
            .bind(spec.category.to_string())
            .bind(&spec.municipality)
            .bind(&spec.config)
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?,
        };

        row.try_into()
    }

    async fn active_sources(&self) -> Result<Vec<Source>> {
        let rows: Vec<SourceRow> =
            sqlx::query_as("SELECT * FROM sources WHERE is_active ORDER BY name")
                .fetch_all(&self.pool)
                .await
                .map_err(db_err)?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn mark_fetched(&self, source_id: Uuid, at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE sources SET last_fetched_at = $2 WHERE id = $1")
            .bind(source_id)
            .bind(at)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn set_source_active(&self, source_id: Uuid, active: bool) -> Result<()> {
        sqlx::query("UPDATE sources SET is_active = $2 WHERE id = $1")
            .bind(source_id)
            .bind(active)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn insert_report(&self, report: NewReport) -> Result<ReportInsert> {
        let row: Option<ReportRow> = sqlx::query_as(
            r#"
            INSERT INTO incident_reports
                (source_id, external_id, source_url, raw_text, extracted,
                 incident_type, category, address, city, lat, lng,
                 occurred_at, extraction_model, extraction_confidence, source_type)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            ON CONFLICT (source_id, external_id) DO NOTHING
            RETURNING *
            "#,
        )
        .bind(report.source_id)
        .bind(&report.external_id)
        .bind(&report.source_url)
        .bind(&report.raw_text)
        .bind(&report.extracted)
        .bind(&report.incident_type)
        .bind(report.category.to_string())
        .bind(&report.address)
        .bind(&report.city)
        .bind(report.location.map(|p| p.lat))
        .bind(report.location.map(|p| p.lng))
        .bind(report.occurred_at)
        .bind(&report.extraction_model)
        .bind(report.extraction_confidence)
        .bind(report.source_type.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        match row {
            Some(row) => Ok(ReportInsert::Inserted(row.try_into()?)),
            None => Ok(ReportInsert::Duplicate),
        }
    }

    async fn report(&self, id: Uuid) -> Result<Option<IncidentReport>> {
        let row: Option<ReportRow> =
            sqlx::query_as("SELECT * FROM incident_reports WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(db_err)?;
        row.map(TryInto::try_into).transpose()
    }

    async fn pending_reports(&self, limit: i64) -> Result<Vec<IncidentReport>> {
        let rows: Vec<ReportRow> = sqlx::query_as(
            r#"
            SELECT * FROM incident_reports
            WHERE dedup_status = 'pending'
            ORDER BY ingested_at ASC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn reports_for_incident(&self, incident_id: Uuid) -> Result<Vec<IncidentReport>> {
        let rows: Vec<ReportRow> = sqlx::query_as(
            "SELECT * FROM incident_reports WHERE incident_id = $1 ORDER BY ingested_at ASC",
        )
        .bind(incident_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn incident(&self, id: Uuid) -> Result<Option<Incident>> {
        let row: Option<IncidentRow> = sqlx::query_as("SELECT * FROM incidents WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.map(TryInto::try_into).transpose()
    }

    async fn incidents_near(
        &self,
        point: GeoPoint,
        radius_m: f64,
        around: DateTime<Utc>,
        window: Duration,
    ) -> Result<Vec<Incident>> {
        let (min_lat, max_lat, min_lng, max_lng) = bbox(point, radius_m);
        let rows: Vec<IncidentRow> = sqlx::query_as(
            r#"
            SELECT * FROM incidents
            WHERE lat BETWEEN $1 AND $2
              AND lng BETWEEN $3 AND $4
              AND COALESCE(occurred_at, reported_at) BETWEEN $5 AND $6
            "#,
        )
        .bind(min_lat)
        .bind(max_lat)
        .bind(min_lng)
        .bind(max_lng)
        .bind(around - window)
        .bind(around + window)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        // Exact distance check on top of the box prefilter.
        let incidents: Vec<Incident> = rows
            .into_iter()
            .map(TryInto::try_into)
            .collect::<Result<Vec<Incident>>>()?;
        Ok(incidents
            .into_iter()
            .filter(|i| {
                i.location
                    .map(|loc| loc.distance_m(&point) <= radius_m)
                    .unwrap_or(false)
            })
            .collect())
    }

    async fn create_incident_for_report(
        &self,
        report_id: Uuid,
        incident: NewIncident,
    ) -> Result<Incident> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let report: ReportRow =
            sqlx::query_as("SELECT * FROM incident_reports WHERE id = $1 FOR UPDATE")
                .bind(report_id)
                .fetch_one(&mut *tx)
                .await
                .map_err(db_err)?;

        let single = quality::derive_incident_state(&[(
            report.extraction_confidence,
            report.source_type.parse().map_err(RangerError::Database)?,
        )]);
        let status = proposed_status(single.confidence_score);
        let source_types: Vec<String> =
            single.source_types.iter().map(|s| s.to_string()).collect();

        let row: IncidentRow = sqlx::query_as(
            r#"
            INSERT INTO incidents
                (incident_type, category, urgency_score, lat, lng,
                 location_resolution, location_confidence, address, city, region,
                 occurred_at, reported_at, title, description,
                 report_count, source_types, confidence_score, review_status)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14,
                    $15, $16, $17, $18)
            RETURNING *
            "#,
        )
        .bind(&incident.incident_type)
        .bind(incident.category.to_string())
        .bind(incident.urgency_score)
        .bind(incident.location.map(|p| p.lat))
        .bind(incident.location.map(|p| p.lng))
        .bind(incident.location_resolution.to_string())
        .bind(incident.location_confidence)
        .bind(&incident.address)
        .bind(&incident.city)
        .bind(&incident.region)
        .bind(incident.occurred_at)
        .bind(report.ingested_at)
        .bind(&incident.title)
        .bind(&incident.description)
        .bind(single.report_count)
        .bind(&source_types)
        .bind(single.confidence_score)
        .bind(status.to_string())
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err)?;

        let updated = sqlx::query(
            r#"
            UPDATE incident_reports
            SET incident_id = $2, dedup_status = 'new_incident', dedup_processed_at = now()
            WHERE id = $1 AND dedup_status = 'pending'
            "#,
        )
        .bind(report_id)
        .bind(row.id)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        if updated.rows_affected() == 0 {
            return Err(RangerError::Validation(format!(
                "report {report_id} is no longer pending"
            )));
        }

        tx.commit().await.map_err(db_err)?;
        row.try_into()
    }

    async fn link_report_to_incident(
        &self,
        report_id: Uuid,
        incident_id: Uuid,
    ) -> Result<Incident> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        Self::lock_incident(&mut tx, incident_id).await?;

        let updated = sqlx::query(
            r#"
            UPDATE incident_reports
            SET incident_id = $2, dedup_status = 'matched', dedup_processed_at = now()
            WHERE id = $1 AND dedup_status = 'pending'
            "#,
        )
        .bind(report_id)
        .bind(incident_id)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        if updated.rows_affected() == 0 {
            return Err(RangerError::Validation(format!(
                "report {report_id} is no longer pending"
            )));
        }

        let incident = Self::recompute_in_tx(&mut tx, incident_id).await?;
        tx.commit().await.map_err(db_err)?;
        Ok(incident)
    }

    async fn review_incident(
        &self,
        incident_id: Uuid,
        action: ReviewAction,
        reviewed_by: &str,
    ) -> Result<Incident> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        Self::lock_incident(&mut tx, incident_id).await?;

        let status = match action {
            ReviewAction::Approve => "approved",
            ReviewAction::Reject => "rejected",
        };

        let row: Option<IncidentRow> = sqlx::query_as(
            r#"
            UPDATE incidents
            SET review_status = $2, reviewed_at = now(), reviewed_by = $3, updated_at = now()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(incident_id)
        .bind(status)
        .bind(reviewed_by)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?;
        let row = row.ok_or(RangerError::IncidentNotFound(incident_id))?;

        if action == ReviewAction::Reject {
            sqlx::query(
                r#"
                UPDATE incident_reports
                SET dedup_status = 'rejected', dedup_processed_at = now()
                WHERE incident_id = $1
                "#,
            )
            .bind(incident_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }

        tx.commit().await.map_err(db_err)?;
        info!(incident_id = %incident_id, status, reviewed_by, "Operator review applied");
        row.try_into()
    }

    async fn query_incidents(&self, filter: &IncidentFilter) -> Result<Vec<Incident>> {
        // Dynamic filters via null-tolerant predicates; statuses passed as a
        // text array.
        let statuses: Option<Vec<String>> = filter
            .review_statuses
            .as_ref()
            .map(|s| s.iter().map(|r| r.to_string()).collect());
        let limit = if filter.limit > 0 { filter.limit } else { 100 };

        let rows: Vec<IncidentRow> = sqlx::query_as(
            r#"
            SELECT * FROM incidents
            WHERE ($1::text IS NULL OR region = $1)
              AND ($2::text IS NULL OR category = $2)
              AND ($3::text IS NULL OR city = $3)
              AND ($4::int IS NULL OR urgency_score >= $4)
              AND ($5::timestamptz IS NULL OR COALESCE(occurred_at, reported_at) >= $5)
              AND ($6::timestamptz IS NULL OR COALESCE(occurred_at, reported_at) < $6)
              AND ($7::text[] IS NULL OR review_status = ANY($7))
            ORDER BY COALESCE(occurred_at, reported_at) DESC
            LIMIT $8
            "#,
        )
        .bind(&filter.region)
        .bind(filter.category.map(|c| c.to_string()))
        .bind(&filter.city)
        .bind(filter.min_urgency)
        .bind(filter.since)
        .bind(filter.until)
        .bind(&statuses)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn review_queue(
        &self,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<(Incident, Vec<IncidentReport>)>> {
        let rows: Vec<IncidentRow> = sqlx::query_as(
            r#"
            SELECT * FROM incidents
            WHERE review_status = 'needs_review'
            ORDER BY created_at ASC
            LIMIT $1 OFFSET $2
            "#,
        )
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        let mut queue = Vec::with_capacity(rows.len());
        for row in rows {
            let incident: Incident = row.try_into()?;
            let reports = self.reports_for_incident(incident.id).await?;
            queue.push((incident, reports));
        }
        Ok(queue)
    }

    async fn incidents_between(
        &self,
        region: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Incident>> {
        let rows: Vec<IncidentRow> = sqlx::query_as(
            r#"
            SELECT * FROM incidents
            WHERE region = $1
              AND COALESCE(occurred_at, reported_at) >= $2
              AND COALESCE(occurred_at, reported_at) < $3
            "#,
        )
        .bind(region)
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn news_reports_between(
        &self,
        region: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<IncidentReport>> {
        let rows: Vec<ReportRow> = sqlx::query_as(
            r#"
            SELECT r.* FROM incident_reports r
            JOIN sources s ON s.id = r.source_id
            WHERE s.region = $1
              AND s.category = 'news'
              AND COALESCE(r.occurred_at, r.ingested_at) >= $2
              AND COALESCE(r.occurred_at, r.ingested_at) < $3
            "#,
        )
        .bind(region)
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn upsert_rollup(&self, rollup: NewRollup) -> Result<WeeklyRollup> {
        let row: RollupRow = sqlx::query_as(
            r#"
            INSERT INTO weekly_rollups
                (week_start, municipality, incident_count, incidents_by_category,
                 news_count, news_by_category, incident_trend, summary_text)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (week_start, COALESCE(municipality, ''))
            DO UPDATE SET
                incident_count = EXCLUDED.incident_count,
                incidents_by_category = EXCLUDED.incidents_by_category,
                news_count = EXCLUDED.news_count,
                news_by_category = EXCLUDED.news_by_category,
                incident_trend = EXCLUDED.incident_trend,
                summary_text = EXCLUDED.summary_text
            RETURNING *
            "#,
        )
        .bind(rollup.week_start)
        .bind(&rollup.municipality)
        .bind(rollup.incident_count)
        .bind(&rollup.incidents_by_category)
        .bind(rollup.news_count)
        .bind(&rollup.news_by_category)
        .bind(rollup.incident_trend)
        .bind(&rollup.summary_text)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(row.into())
    }

    async fn rollups(
        &self,
        municipality: Option<&str>,
        weeks: i64,
    ) -> Result<Vec<WeeklyRollup>> {
        let rows: Vec<RollupRow> = sqlx::query_as(
            r#"
            SELECT * FROM weekly_rollups
            WHERE municipality IS NOT DISTINCT FROM $1
            ORDER BY week_start DESC
            LIMIT $2
            "#,
        )
        .bind(municipality)
        .bind(weeks)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn insert_centerlines(&self, lines: Vec<StreetCenterline>) -> Result<u64> {
        let mut inserted = 0u64;
        for line in lines {
            let geometry = serde_json::to_value(&line.geometry)
                .map_err(|e| RangerError::Database(e.to_string()))?;
            sqlx::query(
                r#"
                INSERT INTO street_centerlines
                    (id, region, street_name, street_name_normalized,
                     from_address, to_address, city, geometry)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                ON CONFLICT (id) DO NOTHING
                "#,
            )
            .bind(line.id)
            .bind(&line.region)
            .bind(&line.street_name)
            .bind(&line.street_name_normalized)
            .bind(line.from_address)
            .bind(line.to_address)
            .bind(&line.city)
            .bind(&geometry)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
            inserted += 1;
        }
        Ok(inserted)
    }

    async fn centerlines_spanning(
        &self,
        region: &str,
        street: &str,
        block_number: i32,
    ) -> Result<Vec<StreetCenterline>> {
        let rows: Vec<CenterlineRow> = sqlx::query_as(
            r#"
            SELECT * FROM street_centerlines
            WHERE region = $1
              AND street_name_normalized LIKE '%' || $2 || '%'
              AND from_address <= $3
              AND to_address >= $3
            ORDER BY street_name_normalized, from_address, id
            "#,
        )
        .bind(region)
        .bind(street)
        .bind(block_number)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.into_iter().map(TryInto::try_into).collect()
    }
}
