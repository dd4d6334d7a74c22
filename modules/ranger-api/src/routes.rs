//! Read API over the store. Handlers never surface pipeline errors: bad
//! input is a 400, internal failures log a warning and return 500, and the
//! queue endpoints expose exactly the operator contract.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::get,
    Router,
};
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use tower_http::cors::{Any, CorsLayer};
use tracing::warn;
use uuid::Uuid;

use ranger_common::{Incident, IncidentCategory, IncidentReport, ReviewStatus};
use ranger_store::{IncidentFilter, IncidentStore, ReviewAction};

const REVIEW_QUEUE_MAX_LIMIT: i64 = 50;
const ROLLUP_MAX_WEEKS: i64 = 12;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn IncidentStore>,
    pub region: String,
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/incidents", get(api_incidents))
        .route("/review-queue", get(api_review_queue).post(api_review_action))
        .route("/rollup", get(api_rollup))
        .route("/health", get(health))
        .layer(cors)
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

// --- Query structs ---

#[derive(Deserialize)]
pub struct IncidentsQuery {
    region: Option<String>,
    category: Option<String>,
    city: Option<String>,
    min_urgency: Option<i32>,
    since: Option<DateTime<Utc>>,
    until: Option<DateTime<Utc>>,
    limit: Option<i64>,
}

#[derive(Deserialize)]
pub struct ReviewQueueQuery {
    limit: Option<i64>,
    offset: Option<i64>,
}

#[derive(Deserialize)]
pub struct ReviewActionBody {
    incident_id: Uuid,
    action: String,
    #[serde(default)]
    notes: Option<String>,
}

#[derive(Deserialize)]
pub struct RollupQuery {
    municipality: Option<String>,
    weeks: Option<i64>,
}

// --- Handlers ---

/// Public incidents: only auto_published, unverified and approved rows.
async fn api_incidents(
    State(state): State<AppState>,
    Query(params): Query<IncidentsQuery>,
) -> impl IntoResponse {
    let category = match params.category.as_deref() {
        Some(raw) => match raw.parse::<IncidentCategory>() {
            Ok(c) => Some(c),
            Err(_) => return StatusCode::BAD_REQUEST.into_response(),
        },
        None => None,
    };

    let filter = IncidentFilter {
        region: params.region.or_else(|| Some(state.region.clone())),
        category,
        city: params.city,
        min_urgency: params.min_urgency,
        since: params.since,
        until: params.until,
        review_statuses: Some(vec![
            ReviewStatus::AutoPublished,
            ReviewStatus::Unverified,
            ReviewStatus::Approved,
        ]),
        limit: params.limit.unwrap_or(100).clamp(1, 500),
    };

    match state.store.query_incidents(&filter).await {
        Ok(incidents) => Json(serde_json::json!({
            "incidents": incidents.iter().map(incident_json).collect::<Vec<_>>(),
        }))
        .into_response(),
        Err(e) => {
            warn!(error = %e, "Failed to query incidents");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// The HITL queue: needs_review incidents plus their linked reports for
/// operator context.
async fn api_review_queue(
    State(state): State<AppState>,
    Query(params): Query<ReviewQueueQuery>,
) -> impl IntoResponse {
    let limit = params.limit.unwrap_or(REVIEW_QUEUE_MAX_LIMIT).clamp(1, REVIEW_QUEUE_MAX_LIMIT);
    let offset = params.offset.unwrap_or(0).max(0);

    match state.store.review_queue(limit, offset).await {
        Ok(queue) => {
            let items: Vec<serde_json::Value> = queue
                .iter()
                .map(|(incident, reports)| {
                    serde_json::json!({
                        "incident": incident_json(incident),
                        "reports": reports.iter().map(report_json).collect::<Vec<_>>(),
                    })
                })
                .collect();
            Json(serde_json::json!({ "queue": items })).into_response()
        }
        Err(e) => {
            warn!(error = %e, "Failed to load review queue");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Operator decision. Rejection cascades to the incident's linked reports.
async fn api_review_action(
    State(state): State<AppState>,
    Json(body): Json<ReviewActionBody>,
) -> impl IntoResponse {
    let action = match body.action.as_str() {
        "approve" => ReviewAction::Approve,
        "reject" => ReviewAction::Reject,
        _ => return StatusCode::BAD_REQUEST.into_response(),
    };

    if let Some(notes) = &body.notes {
        tracing::info!(incident_id = %body.incident_id, notes = notes.as_str(), "Review notes");
    }

    match state
        .store
        .review_incident(body.incident_id, action, "operator")
        .await
    {
        Ok(incident) => Json(incident_json(&incident)).into_response(),
        Err(ranger_common::RangerError::IncidentNotFound(_)) => {
            StatusCode::NOT_FOUND.into_response()
        }
        Err(e) => {
            warn!(incident_id = %body.incident_id, error = %e, "Review action failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Weekly rollups plus live last-24h / last-7d counts.
async fn api_rollup(
    State(state): State<AppState>,
    Query(params): Query<RollupQuery>,
) -> impl IntoResponse {
    let weeks = params.weeks.unwrap_or(ROLLUP_MAX_WEEKS).clamp(1, ROLLUP_MAX_WEEKS);
    let now = Utc::now();

    let rollups = match state
        .store
        .rollups(params.municipality.as_deref(), weeks)
        .await
    {
        Ok(rollups) => rollups,
        Err(e) => {
            warn!(error = %e, "Failed to load rollups");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let last_7d = match state
        .store
        .incidents_between(&state.region, now - Duration::days(7), now)
        .await
    {
        Ok(incidents) => live_count(&incidents, params.municipality.as_deref()),
        Err(e) => {
            warn!(error = %e, "Failed to compute live counts");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };
    let last_24h = match state
        .store
        .incidents_between(&state.region, now - Duration::hours(24), now)
        .await
    {
        Ok(incidents) => live_count(&incidents, params.municipality.as_deref()),
        Err(e) => {
            warn!(error = %e, "Failed to compute live counts");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    Json(serde_json::json!({
        "rollups": rollups,
        "live": { "last_24h": last_24h, "last_7d": last_7d },
    }))
    .into_response()
}

fn live_count(incidents: &[Incident], municipality: Option<&str>) -> usize {
    incidents
        .iter()
        .filter(|i| i.review_status != ReviewStatus::Rejected)
        .filter(|i| match municipality {
            None => true,
            Some(m) => i.city.as_deref() == Some(m),
        })
        .count()
}

// --- JSON projections ---

fn incident_json(incident: &Incident) -> serde_json::Value {
    serde_json::json!({
        "id": incident.id,
        "incident_type": incident.incident_type,
        "category": incident.category,
        "urgency_score": incident.urgency_score,
        "location": incident.location,
        "location_resolution": incident.location_resolution,
        "location_confidence": incident.location_confidence,
        "address": incident.address,
        "city": incident.city,
        "region": incident.region,
        "occurred_at": incident.occurred_at,
        "reported_at": incident.reported_at,
        "title": incident.title,
        "description": incident.description,
        "report_count": incident.report_count,
        "source_types": incident.source_types,
        "confidence_score": incident.confidence_score,
        "review_status": incident.review_status,
        "status": incident.status,
    })
}

fn report_json(report: &IncidentReport) -> serde_json::Value {
    serde_json::json!({
        "id": report.id,
        "source_id": report.source_id,
        "source_url": report.source_url,
        "incident_type": report.incident_type,
        "category": report.category,
        "address": report.address,
        "city": report.city,
        "location": report.location,
        "occurred_at": report.occurred_at,
        "ingested_at": report.ingested_at,
        "extraction_model": report.extraction_model,
        "extraction_confidence": report.extraction_confidence,
        "source_type": report.source_type,
        "dedup_status": report.dedup_status,
    })
}
