//! Spatiotemporal linking: associate a geocoded report with an existing
//! canonical incident, or materialise a new one. Reports are linked, never
//! merged — provenance stays intact and the incident only carries derived
//! summaries of its linked set.

use std::sync::Arc;

use chrono::Duration;
use tracing::info;

use ranger_common::{
    Incident, IncidentReport, LocationResolution, RangerError, Result,
};
use ranger_store::{IncidentStore, NewIncident};

/// Linking thresholds. The 0.55 match threshold is canonical; change it
/// here, never inline.
#[derive(Debug, Clone)]
pub struct DedupConfig {
    pub radius_m: f64,
    /// Scoring half-window; the time term decays to zero across it.
    pub time_window: Duration,
    pub match_threshold: f64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            radius_m: 300.0,
            time_window: Duration::hours(3),
            match_threshold: 0.55,
        }
    }
}

impl DedupConfig {
    /// Candidate search casts a wider net than the scoring window: a report
    /// can still clear the threshold on distance and type alone when its
    /// time delta has decayed to zero (scanner at 02:31, news write-up at
    /// 06:00), so the search window is twice the scoring window.
    pub fn candidate_window(&self) -> Duration {
        self.time_window * 2
    }
}

const WEIGHT_DISTANCE: f64 = 0.5;
const WEIGHT_TIME: f64 = 0.3;
const WEIGHT_TYPE: f64 = 0.2;

/// A candidate incident with its match score and the tie-break keys.
#[derive(Debug, Clone)]
pub struct MatchCandidate {
    pub incident: Incident,
    pub score: f64,
    pub distance_m: f64,
    pub dt_minutes: f64,
}

/// Score one candidate. All three weighted terms are always present (a term
/// at zero still ranks candidates correctly when times or types are
/// missing); terms floor at zero rather than going negative.
pub fn match_score(
    config: &DedupConfig,
    report: &IncidentReport,
    incident: &Incident,
) -> Option<MatchCandidate> {
    let report_location = report.location?;
    let incident_location = incident.location?;

    let distance_m = report_location.distance_m(&incident_location);
    if distance_m > config.radius_m {
        return None;
    }

    let dt_minutes = (report.dedup_time() - incident.dedup_time())
        .num_seconds()
        .abs() as f64
        / 60.0;
    let window_minutes = config.time_window.num_minutes() as f64;

    let distance_term = 1.0 - distance_m / config.radius_m;
    let time_term = (1.0 - dt_minutes / window_minutes).max(0.0);
    let type_term = if report
        .incident_type
        .eq_ignore_ascii_case(&incident.incident_type)
    {
        1.0
    } else {
        0.0
    };

    Some(MatchCandidate {
        incident: incident.clone(),
        score: WEIGHT_DISTANCE * distance_term + WEIGHT_TIME * time_term + WEIGHT_TYPE * type_term,
        distance_m,
        dt_minutes,
    })
}

/// Best candidate under the deterministic tie-break: highest score, then
/// smallest distance, then smallest time delta, then smallest incident id.
pub fn best_candidate(mut candidates: Vec<MatchCandidate>) -> Option<MatchCandidate> {
    candidates.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(
                a.distance_m
                    .partial_cmp(&b.distance_m)
                    .unwrap_or(std::cmp::Ordering::Equal),
            )
            .then(
                a.dt_minutes
                    .partial_cmp(&b.dt_minutes)
                    .unwrap_or(std::cmp::Ordering::Equal),
            )
            .then(a.incident.id.cmp(&b.incident.id))
    });
    candidates.into_iter().next()
}

#[derive(Debug)]
pub enum DedupOutcome {
    Linked {
        incident: Incident,
        score: f64,
        distance_m: f64,
    },
    Created(Incident),
}

pub struct Deduplicator {
    store: Arc<dyn IncidentStore>,
    config: DedupConfig,
}

impl Deduplicator {
    pub fn new(store: Arc<dyn IncidentStore>, config: DedupConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &DedupConfig {
        &self.config
    }

    /// Run one pending report through linking. Reports without a location
    /// can't be matched spatially and always open a new incident.
    pub async fn process(&self, report: &IncidentReport, region: &str) -> Result<DedupOutcome> {
        if let Some(point) = report.location {
            let candidates = self
                .store
                .incidents_near(
                    point,
                    self.config.radius_m,
                    report.dedup_time(),
                    self.config.candidate_window(),
                )
                .await?;

            let scored: Vec<MatchCandidate> = candidates
                .iter()
                .filter_map(|incident| match_score(&self.config, report, incident))
                .collect();

            if let Some(best) = best_candidate(scored) {
                if best.score >= self.config.match_threshold {
                    let incident = self
                        .store
                        .link_report_to_incident(report.id, best.incident.id)
                        .await?;
                    info!(
                        report_id = %report.id,
                        incident_id = %incident.id,
                        score = best.score,
                        distance_m = best.distance_m,
                        "Linked report to existing incident"
                    );
                    return Ok(DedupOutcome::Linked {
                        incident,
                        score: best.score,
                        distance_m: best.distance_m,
                    });
                }
            }
        }

        let incident = self
            .store
            .create_incident_for_report(report.id, incident_from_report(report, region)?)
            .await?;
        info!(
            report_id = %report.id,
            incident_id = %incident.id,
            incident_type = incident.incident_type.as_str(),
            "Created new canonical incident"
        );
        Ok(DedupOutcome::Created(incident))
    }
}

/// Seed a canonical incident from an unmatched report. Title, description,
/// urgency and the geocode tier come from the report's extracted payload.
fn incident_from_report(report: &IncidentReport, region: &str) -> Result<NewIncident> {
    let payload = &report.extracted;
    let title = payload
        .get("title")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .unwrap_or(&report.incident_type)
        .to_string();
    let description = payload
        .get("description")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();
    let urgency_score = payload
        .get("urgency_score")
        .and_then(|v| v.as_i64())
        .unwrap_or(5)
        .clamp(1, 10) as i32;
    let location_resolution: LocationResolution = payload
        .get("location_resolution")
        .and_then(|v| v.as_str())
        .unwrap_or("unknown")
        .parse()
        .map_err(RangerError::Validation)?;
    let location_confidence = payload
        .get("location_confidence")
        .and_then(|v| v.as_f64())
        .unwrap_or(0.0);

    Ok(NewIncident {
        incident_type: report.incident_type.clone(),
        category: report.category,
        urgency_score,
        location: report.location,
        location_resolution,
        location_confidence,
        address: report.address.clone(),
        city: report.city.clone(),
        region: region.to_string(),
        occurred_at: report.occurred_at,
        title,
        description,
    })
}
