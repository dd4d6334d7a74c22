//! In-memory store for the test harness.
//!
//! One mutex guards the whole state, which also serializes link/recompute the
//! way the Postgres backend's advisory lock does. Semantics mirror
//! [`crate::pg::PgStore`] exactly; scenario tests run against this backend.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use ranger_common::{
    next_review_status, proposed_status, quality, DedupStatus, GeoPoint, Incident, IncidentReport,
    IncidentStatus, RangerError, Result, ReviewStatus, Source, SourceCategory, StreetCenterline,
    WeeklyRollup,
};

use crate::{
    IncidentFilter, IncidentStore, NewIncident, NewReport, NewRollup, ReportInsert, ReviewAction,
    SourceSpec,
};

#[derive(Default)]
struct Inner {
    sources: HashMap<Uuid, Source>,
    reports: HashMap<Uuid, IncidentReport>,
    incidents: HashMap<Uuid, Incident>,
    centerlines: Vec<StreetCenterline>,
    rollups: Vec<WeeklyRollup>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn recompute_locked(inner: &mut Inner, incident_id: Uuid) -> Result<Incident> {
        let pairs: Vec<_> = inner
            .reports
            .values()
            .filter(|r| {
                r.incident_id == Some(incident_id)
                    && matches!(
                        r.dedup_status,
                        DedupStatus::Matched | DedupStatus::NewIncident
                    )
            })
            .map(|r| (r.extraction_confidence, r.source_type))
            .collect();
        let derived = quality::derive_incident_state(&pairs);

        let incident = inner
            .incidents
            .get_mut(&incident_id)
            .ok_or(RangerError::IncidentNotFound(incident_id))?;
        incident.report_count = derived.report_count;
        incident.source_types = derived.source_types;
        incident.confidence_score = derived.confidence_score;
        incident.review_status =
            next_review_status(incident.review_status, incident.confidence_score);
        incident.updated_at = Utc::now();
        Ok(incident.clone())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("memory store poisoned")
    }
}

#[async_trait::async_trait]
impl IncidentStore for MemoryStore {
    async fn upsert_source(&self, spec: &SourceSpec) -> Result<Source> {
        let mut inner = self.lock();
        if let Some(existing) = inner
            .sources
            .values_mut()
            .find(|s| s.region == spec.region && s.url == spec.url)
        {
            existing.name = spec.name.clone();
            existing.source_type = spec.source_type;
            existing.category = spec.category;
            existing.municipality = spec.municipality.clone();
            existing.config = spec.config.clone();
            existing.is_active = true;
            return Ok(existing.clone());
        }

        let source = Source {
            id: Uuid::new_v4(),
            name: spec.name.clone(),
            source_type: spec.source_type,
            url: spec.url.clone(),
            region: spec.region.clone(),
            category: spec.category,
            municipality: spec.municipality.clone(),
            config: spec.config.clone(),
            is_active: true,
            reliability_score: 0.5,
            last_fetched_at: None,
            created_at: Utc::now(),
        };
        inner.sources.insert(source.id, source.clone());
        Ok(source)
    }

    async fn active_sources(&self) -> Result<Vec<Source>> {
        let inner = self.lock();
        let mut sources: Vec<Source> = inner
            .sources
            .values()
            .filter(|s| s.is_active)
            .cloned()
            .collect();
        sources.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(sources)
    }

    async fn mark_fetched(&self, source_id: Uuid, at: DateTime<Utc>) -> Result<()> {
        let mut inner = self.lock();
        if let Some(s) = inner.sources.get_mut(&source_id) {
            s.last_fetched_at = Some(at);
        }
        Ok(())
    }

    async fn set_source_active(&self, source_id: Uuid, active: bool) -> Result<()> {
        let mut inner = self.lock();
        if let Some(s) = inner.sources.get_mut(&source_id) {
            s.is_active = active;
        }
        Ok(())
    }

    async fn insert_report(&self, report: NewReport) -> Result<ReportInsert> {
        let mut inner = self.lock();
        let duplicate = inner.reports.values().any(|r| {
            r.source_id == report.source_id && r.external_id == report.external_id
        });
        if duplicate {
            return Ok(ReportInsert::Duplicate);
        }

        let stored = IncidentReport {
            id: Uuid::new_v4(),
            source_id: report.source_id,
            external_id: report.external_id,
            source_url: report.source_url,
            raw_text: report.raw_text,
            extracted: report.extracted,
            incident_type: report.incident_type,
            category: report.category,
            address: report.address,
            city: report.city,
            location: report.location,
            occurred_at: report.occurred_at,
            ingested_at: Utc::now(),
            extraction_model: report.extraction_model,
            extraction_confidence: report.extraction_confidence,
            source_type: report.source_type,
            dedup_status: DedupStatus::Pending,
            dedup_processed_at: None,
            incident_id: None,
        };
        inner.reports.insert(stored.id, stored.clone());
        Ok(ReportInsert::Inserted(stored))
    }

    async fn report(&self, id: Uuid) -> Result<Option<IncidentReport>> {
        Ok(self.lock().reports.get(&id).cloned())
    }

    async fn pending_reports(&self, limit: i64) -> Result<Vec<IncidentReport>> {
        let inner = self.lock();
        let mut pending: Vec<IncidentReport> = inner
            .reports
            .values()
            .filter(|r| r.dedup_status == DedupStatus::Pending)
            .cloned()
            .collect();
        pending.sort_by_key(|r| r.ingested_at);
        pending.truncate(limit as usize);
        Ok(pending)
    }

    async fn reports_for_incident(&self, incident_id: Uuid) -> Result<Vec<IncidentReport>> {
        let inner = self.lock();
        let mut reports: Vec<IncidentReport> = inner
            .reports
            .values()
            .filter(|r| r.incident_id == Some(incident_id))
            .cloned()
            .collect();
        reports.sort_by_key(|r| r.ingested_at);
        Ok(reports)
    }

    async fn incident(&self, id: Uuid) -> Result<Option<Incident>> {
        Ok(self.lock().incidents.get(&id).cloned())
    }

    async fn incidents_near(
        &self,
        point: GeoPoint,
        radius_m: f64,
        around: DateTime<Utc>,
        window: Duration,
    ) -> Result<Vec<Incident>> {
        let inner = self.lock();
        Ok(inner
            .incidents
            .values()
            .filter(|i| {
                let Some(loc) = i.location else {
                    return false;
                };
                loc.distance_m(&point) <= radius_m
                    && (i.dedup_time() - around).abs() <= window
            })
            .cloned()
            .collect())
    }

    async fn create_incident_for_report(
        &self,
        report_id: Uuid,
        incident: NewIncident,
    ) -> Result<Incident> {
        let mut inner = self.lock();

        let report = inner
            .reports
            .get(&report_id)
            .cloned()
            .ok_or_else(|| RangerError::Validation(format!("unknown report {report_id}")))?;
        if report.dedup_status != DedupStatus::Pending {
            return Err(RangerError::Validation(format!(
                "report {report_id} is no longer pending"
            )));
        }

        let single =
            quality::derive_incident_state(&[(report.extraction_confidence, report.source_type)]);
        let now = Utc::now();
        let stored = Incident {
            id: Uuid::new_v4(),
            incident_type: incident.incident_type,
            category: incident.category,
            urgency_score: incident.urgency_score,
            location: incident.location,
            location_resolution: incident.location_resolution,
            location_confidence: incident.location_confidence,
            address: incident.address,
            city: incident.city,
            region: incident.region,
            occurred_at: incident.occurred_at,
            reported_at: report.ingested_at,
            title: incident.title,
            description: incident.description,
            report_count: single.report_count,
            source_types: single.source_types,
            confidence_score: single.confidence_score,
            review_status: proposed_status(single.confidence_score),
            reviewed_at: None,
            reviewed_by: None,
            status: IncidentStatus::Active,
            created_at: now,
            updated_at: now,
        };
        inner.incidents.insert(stored.id, stored.clone());

        let report = inner.reports.get_mut(&report_id).expect("checked above");
        report.incident_id = Some(stored.id);
        report.dedup_status = DedupStatus::NewIncident;
        report.dedup_processed_at = Some(now);

        Ok(stored)
    }

    async fn link_report_to_incident(
        &self,
        report_id: Uuid,
        incident_id: Uuid,
    ) -> Result<Incident> {
        let mut inner = self.lock();

        let report = inner
            .reports
            .get_mut(&report_id)
            .ok_or_else(|| RangerError::Validation(format!("unknown report {report_id}")))?;
        if report.dedup_status != DedupStatus::Pending {
            return Err(RangerError::Validation(format!(
                "report {report_id} is no longer pending"
            )));
        }
        report.incident_id = Some(incident_id);
        report.dedup_status = DedupStatus::Matched;
        report.dedup_processed_at = Some(Utc::now());

        Self::recompute_locked(&mut inner, incident_id)
    }

    async fn review_incident(
        &self,
        incident_id: Uuid,
        action: ReviewAction,
        reviewed_by: &str,
    ) -> Result<Incident> {
        let mut inner = self.lock();
        let now = Utc::now();

        let incident = inner
            .incidents
            .get_mut(&incident_id)
            .ok_or(RangerError::IncidentNotFound(incident_id))?;
        incident.review_status = match action {
            ReviewAction::Approve => ReviewStatus::Approved,
            ReviewAction::Reject => ReviewStatus::Rejected,
        };
        incident.reviewed_at = Some(now);
        incident.reviewed_by = Some(reviewed_by.to_string());
        incident.updated_at = now;
        let result = incident.clone();

        if action == ReviewAction::Reject {
            for report in inner
                .reports
                .values_mut()
                .filter(|r| r.incident_id == Some(incident_id))
            {
                report.dedup_status = DedupStatus::Rejected;
                report.dedup_processed_at = Some(now);
            }
        }

        Ok(result)
    }

    async fn query_incidents(&self, filter: &IncidentFilter) -> Result<Vec<Incident>> {
        let inner = self.lock();
        let mut incidents: Vec<Incident> = inner
            .incidents
            .values()
            .filter(|i| {
                filter.region.as_ref().is_none_or(|r| &i.region == r)
                    && filter.category.is_none_or(|c| i.category == c)
                    && filter
                        .city
                        .as_ref()
                        .is_none_or(|c| i.city.as_deref() == Some(c.as_str()))
                    && filter.min_urgency.is_none_or(|u| i.urgency_score >= u)
                    && filter.since.is_none_or(|s| i.dedup_time() >= s)
                    && filter.until.is_none_or(|u| i.dedup_time() < u)
                    && filter
                        .review_statuses
                        .as_ref()
                        .is_none_or(|s| s.contains(&i.review_status))
            })
            .cloned()
            .collect();
        incidents.sort_by_key(|i| std::cmp::Reverse(i.dedup_time()));
        let limit = if filter.limit > 0 { filter.limit } else { 100 };
        incidents.truncate(limit as usize);
        Ok(incidents)
    }

    async fn review_queue(
        &self,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<(Incident, Vec<IncidentReport>)>> {
        let queue_ids: Vec<Uuid> = {
            let inner = self.lock();
            let mut queue: Vec<&Incident> = inner
                .incidents
                .values()
                .filter(|i| i.review_status == ReviewStatus::NeedsReview)
                .collect();
            queue.sort_by_key(|i| i.created_at);
            queue
                .into_iter()
                .skip(offset as usize)
                .take(limit as usize)
                .map(|i| i.id)
                .collect()
        };

        let mut result = Vec::with_capacity(queue_ids.len());
        for id in queue_ids {
            let incident = self.incident(id).await?.expect("queue id exists");
            let reports = self.reports_for_incident(id).await?;
            result.push((incident, reports));
        }
        Ok(result)
    }

    async fn incidents_between(
        &self,
        region: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Incident>> {
        let inner = self.lock();
        Ok(inner
            .incidents
            .values()
            .filter(|i| i.region == region && i.dedup_time() >= from && i.dedup_time() < to)
            .cloned()
            .collect())
    }

    async fn news_reports_between(
        &self,
        region: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<IncidentReport>> {
        let inner = self.lock();
        Ok(inner
            .reports
            .values()
            .filter(|r| {
                let Some(source) = inner.sources.get(&r.source_id) else {
                    return false;
                };
                let time = r.dedup_time();
                source.region == region
                    && source.category == SourceCategory::News
                    && time >= from
                    && time < to
            })
            .cloned()
            .collect())
    }

    async fn upsert_rollup(&self, rollup: NewRollup) -> Result<WeeklyRollup> {
        let mut inner = self.lock();
        if let Some(existing) = inner.rollups.iter_mut().find(|r| {
            r.week_start == rollup.week_start && r.municipality == rollup.municipality
        }) {
            existing.incident_count = rollup.incident_count;
            existing.incidents_by_category = rollup.incidents_by_category;
            existing.news_count = rollup.news_count;
            existing.news_by_category = rollup.news_by_category;
            existing.incident_trend = rollup.incident_trend;
            existing.summary_text = rollup.summary_text;
            return Ok(existing.clone());
        }

        let stored = WeeklyRollup {
            id: Uuid::new_v4(),
            week_start: rollup.week_start,
            municipality: rollup.municipality,
            incident_count: rollup.incident_count,
            incidents_by_category: rollup.incidents_by_category,
            news_count: rollup.news_count,
            news_by_category: rollup.news_by_category,
            incident_trend: rollup.incident_trend,
            summary_text: rollup.summary_text,
            created_at: Utc::now(),
        };
        inner.rollups.push(stored.clone());
        Ok(stored)
    }

    async fn rollups(
        &self,
        municipality: Option<&str>,
        weeks: i64,
    ) -> Result<Vec<WeeklyRollup>> {
        let inner = self.lock();
        let mut rollups: Vec<WeeklyRollup> = inner
            .rollups
            .iter()
            .filter(|r| r.municipality.as_deref() == municipality)
            .cloned()
            .collect();
        rollups.sort_by_key(|r| std::cmp::Reverse(r.week_start));
        rollups.truncate(weeks as usize);
        Ok(rollups)
    }

    async fn insert_centerlines(&self, lines: Vec<StreetCenterline>) -> Result<u64> {
        let mut inner = self.lock();
        let count = lines.len() as u64;
        inner.centerlines.extend(lines);
        Ok(count)
    }

    async fn centerlines_spanning(
        &self,
        region: &str,
        street: &str,
        block_number: i32,
    ) -> Result<Vec<StreetCenterline>> {
        let inner = self.lock();
        let mut matches: Vec<StreetCenterline> = inner
            .centerlines
            .iter()
            .filter(|c| {
                c.region == region
                    && c.street_name_normalized.contains(street)
                    && c.from_address <= block_number
                    && c.to_address >= block_number
            })
            .cloned()
            .collect();
        matches.sort_by(|a, b| {
            a.street_name_normalized
                .cmp(&b.street_name_normalized)
                .then(a.from_address.cmp(&b.from_address))
                .then(a.id.cmp(&b.id))
        });
        Ok(matches)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ranger_common::{IncidentCategory, LocationResolution, SourceType};

    fn spec(url: &str, category: SourceCategory) -> SourceSpec {
        SourceSpec {
            name: url.to_string(),
            source_type: SourceType::Html,
            url: url.to_string(),
            region: "mchenry_county".to_string(),
            category,
            municipality: None,
            config: serde_json::json!({}),
        }
    }

    fn report(source_id: Uuid, external_id: &str, ec: f64, st: SourceType) -> NewReport {
        NewReport {
            source_id,
            external_id: external_id.to_string(),
            source_url: "https://example.test/a".to_string(),
            raw_text: "raw".to_string(),
            extracted: serde_json::json!({}),
            incident_type: "shooting".to_string(),
            category: IncidentCategory::ViolentCrime,
            address: None,
            city: Some("Crystal Lake".to_string()),
            location: Some(GeoPoint {
                lat: 42.2411,
                lng: -88.3162,
            }),
            occurred_at: Some(Utc::now()),
            extraction_model: "claude-haiku-4-5-20251001".to_string(),
            extraction_confidence: ec,
            source_type: st,
        }
    }

    fn incident_seed() -> NewIncident {
        NewIncident {
            incident_type: "shooting".to_string(),
            category: IncidentCategory::ViolentCrime,
            urgency_score: 8,
            location: Some(GeoPoint {
                lat: 42.2411,
                lng: -88.3162,
            }),
            location_resolution: LocationResolution::Block,
            location_confidence: 0.7,
            address: Some("100 block of N Main St".to_string()),
            city: Some("Crystal Lake".to_string()),
            region: "mchenry_county".to_string(),
            occurred_at: Some(Utc::now()),
            title: "Shots fired".to_string(),
            description: "Shots fired near downtown".to_string(),
        }
    }

    #[tokio::test]
    async fn duplicate_external_id_is_not_reinserted() {
        let store = MemoryStore::new();
        let source = store
            .upsert_source(&spec("https://a.test", SourceCategory::Crime))
            .await
            .unwrap();

        let first = store
            .insert_report(report(source.id, "ext-1", 0.8, SourceType::Html))
            .await
            .unwrap();
        assert!(matches!(first, ReportInsert::Inserted(_)));

        let second = store
            .insert_report(report(source.id, "ext-1", 0.8, SourceType::Html))
            .await
            .unwrap();
        assert!(matches!(second, ReportInsert::Duplicate));
    }

    #[tokio::test]
    async fn link_recomputes_derived_fields() {
        let store = MemoryStore::new();
        let source = store
            .upsert_source(&spec("https://a.test", SourceCategory::Crime))
            .await
            .unwrap();

        let ReportInsert::Inserted(r1) = store
            .insert_report(report(source.id, "ext-1", 0.80, SourceType::Audio))
            .await
            .unwrap()
        else {
            panic!("expected insert");
        };
        let incident = store
            .create_incident_for_report(r1.id, incident_seed())
            .await
            .unwrap();
        assert_eq!(incident.report_count, 1);

        let ReportInsert::Inserted(r2) = store
            .insert_report(report(source.id, "ext-2", 0.85, SourceType::Html))
            .await
            .unwrap()
        else {
            panic!("expected insert");
        };
        let incident = store
            .link_report_to_incident(r2.id, incident.id)
            .await
            .unwrap();

        assert_eq!(incident.report_count, 2);
        assert_eq!(
            incident.source_types,
            vec![SourceType::Audio, SourceType::Html]
        );
        assert!((incident.confidence_score - 0.975).abs() < 1e-9);
        assert_eq!(incident.review_status, ReviewStatus::AutoPublished);
    }

    #[tokio::test]
    async fn linking_is_monotonic() {
        let store = MemoryStore::new();
        let source = store
            .upsert_source(&spec("https://a.test", SourceCategory::Crime))
            .await
            .unwrap();
        let ReportInsert::Inserted(r1) = store
            .insert_report(report(source.id, "ext-1", 0.8, SourceType::Html))
            .await
            .unwrap()
        else {
            panic!("expected insert");
        };
        let incident = store
            .create_incident_for_report(r1.id, incident_seed())
            .await
            .unwrap();

        // A processed report can't be linked again.
        assert!(store
            .link_report_to_incident(r1.id, incident.id)
            .await
            .is_err());
        assert!(store
            .create_incident_for_report(r1.id, incident_seed())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn reject_cascades_and_sticks() {
        let store = MemoryStore::new();
        let source = store
            .upsert_source(&spec("https://a.test", SourceCategory::Crime))
            .await
            .unwrap();
        let ReportInsert::Inserted(r1) = store
            .insert_report(report(source.id, "ext-1", 0.80, SourceType::Audio))
            .await
            .unwrap()
        else {
            panic!("expected insert");
        };
        let incident = store
            .create_incident_for_report(r1.id, incident_seed())
            .await
            .unwrap();
        let ReportInsert::Inserted(r2) = store
            .insert_report(report(source.id, "ext-2", 0.85, SourceType::Html))
            .await
            .unwrap()
        else {
            panic!("expected insert");
        };
        store
            .link_report_to_incident(r2.id, incident.id)
            .await
            .unwrap();

        let rejected = store
            .review_incident(incident.id, ReviewAction::Reject, "operator")
            .await
            .unwrap();
        assert_eq!(rejected.review_status, ReviewStatus::Rejected);
        assert!(rejected.reviewed_at.is_some());

        for report in store.reports_for_incident(incident.id).await.unwrap() {
            assert_eq!(report.dedup_status, DedupStatus::Rejected);
        }
    }

    #[tokio::test]
    async fn rollup_upsert_preserves_identity() {
        let store = MemoryStore::new();
        let rollup = NewRollup {
            week_start: chrono::NaiveDate::from_ymd_opt(2026, 7, 20).unwrap(),
            municipality: None,
            incident_count: 10,
            incidents_by_category: serde_json::json!({"property_crime": 10}),
            news_count: 4,
            news_by_category: serde_json::json!({"property_crime": 4}),
            incident_trend: 25,
            summary_text: "10 incidents".to_string(),
        };

        let first = store.upsert_rollup(rollup.clone()).await.unwrap();
        let second = store.upsert_rollup(rollup).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(first.created_at, second.created_at);
        assert_eq!(second.incident_trend, 25);
        assert_eq!(store.rollups(None, 12).await.unwrap().len(), 1);
    }
}
