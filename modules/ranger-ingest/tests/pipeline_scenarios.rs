//! End-to-end pipeline scenarios against the in-memory store: ingest
//! observations through extraction, geocoding, and linking, then check the
//! canonical incidents and workflow state the pipeline left behind.

mod harness;

use chrono::{Duration, NaiveDate, Utc};
use uuid::Uuid;

use harness::{at, observation, Harness, REGION};
use ranger_common::{
    DedupStatus, GeoPoint, IncidentCategory, LocationResolution, ReviewStatus, SourceCategory,
    SourceType, StreetCenterline,
};
use ranger_ingest::pipeline::ObservationOutcome;
use ranger_ingest::rollup::RollupEngine;
use ranger_store::{IncidentFilter, NewIncident, NewReport, ReportInsert, ReviewAction};

fn counts(outcome: ObservationOutcome) -> ranger_ingest::pipeline::ObservationCounts {
    match outcome {
        ObservationOutcome::Processed(counts) => counts,
        ObservationOutcome::Deferred => panic!("unexpected backpressure in test"),
    }
}

/// Scenario A: a scanner report and a later news report for the same shooting
/// link into one incident that auto-publishes.
#[tokio::test]
async fn scanner_and_news_reports_link_into_one_incident() {
    let h = Harness::new(&[
        ("Depot Ct", 42.2411, -88.3162),
        ("Near Depot Ct", 42.2413, -88.3160),
    ]);
    let scanner = h
        .source("county scanner", SourceType::Audio, SourceCategory::Crime)
        .await;
    let news = h
        .source("local news", SourceType::Html, SourceCategory::News)
        .await;

    let first = counts(
        h.ingest(
            &scanner,
            &observation(
                "scan-1",
                "shooting",
                "violent_crime",
                Some("Depot Ct"),
                Some("Crystal Lake"),
                Some(at(2026, 7, 26, 2, 31)),
                0.80,
            ),
        )
        .await,
    );
    assert_eq!(first.incidents_created, 1);

    let second = counts(
        h.ingest(
            &news,
            &observation(
                "news-1",
                "shooting",
                "violent_crime",
                Some("Near Depot Ct"),
                Some("Crystal Lake"),
                Some(at(2026, 7, 26, 6, 0)),
                0.85,
            ),
        )
        .await,
    );
    assert_eq!(second.incidents_linked, 1);
    assert_eq!(second.incidents_created, 0);

    let incidents = h
        .store
        .query_incidents(&IncidentFilter::default())
        .await
        .unwrap();
    assert_eq!(incidents.len(), 1);

    let incident = &incidents[0];
    assert_eq!(incident.report_count, 2);
    assert_eq!(
        incident.source_types,
        vec![SourceType::Audio, SourceType::Html]
    );
    assert!((incident.confidence_score - 0.975).abs() < 1e-9);
    assert_eq!(incident.review_status, ReviewStatus::AutoPublished);
}

/// Scenario B: 400 m exceeds the 300 m radius, so two nearby same-type
/// reports stay separate incidents.
#[tokio::test]
async fn reports_past_the_radius_stay_separate() {
    let h = Harness::new(&[
        ("First Site", 42.2411, -88.3162),
        // ~400 m north.
        ("Second Site", 42.2447, -88.3162),
    ]);
    let news = h
        .source("local news", SourceType::Html, SourceCategory::News)
        .await;

    h.ingest(
        &news,
        &observation(
            "b-1",
            "burglary",
            "property_crime",
            Some("First Site"),
            Some("Crystal Lake"),
            Some(at(2026, 7, 26, 2, 0)),
            0.85,
        ),
    )
    .await;
    h.ingest(
        &news,
        &observation(
            "b-2",
            "burglary",
            "property_crime",
            Some("Second Site"),
            Some("Crystal Lake"),
            Some(at(2026, 7, 26, 3, 0)),
            0.85,
        ),
    )
    .await;

    let incidents = h
        .store
        .query_incidents(&IncidentFilter::default())
        .await
        .unwrap();
    assert_eq!(incidents.len(), 2);
    assert!(incidents.iter().all(|i| i.report_count == 1));
}

/// Scenario C: a lone low-confidence extraction routes to the review queue.
#[tokio::test]
async fn low_confidence_routes_to_review_queue() {
    let h = Harness::new(&[("Somewhere", 42.2120, -88.2378)]);
    let news = h
        .source("local news", SourceType::Html, SourceCategory::News)
        .await;

    h.ingest(
        &news,
        &observation(
            "c-1",
            "suspicious_activity",
            "suspicious",
            Some("Somewhere"),
            Some("Cary"),
            None,
            0.50,
        ),
    )
    .await;

    let incidents = h
        .store
        .query_incidents(&IncidentFilter::default())
        .await
        .unwrap();
    assert_eq!(incidents.len(), 1);
    assert!((incidents[0].confidence_score - 0.50).abs() < 1e-9);
    assert_eq!(incidents[0].review_status, ReviewStatus::NeedsReview);

    let queue = h.store.review_queue(50, 0).await.unwrap();
    assert_eq!(queue.len(), 1);
    assert_eq!(queue[0].1.len(), 1);
}

/// Scenario D: operator rejection cascades to linked reports and survives
/// later automatic recomputes.
#[tokio::test]
async fn reject_cascades_and_survives_recompute() {
    let h = Harness::new(&[
        ("Site A", 42.2411, -88.3162),
        ("Site B", 42.2412, -88.3161),
        ("Site C", 42.2413, -88.3160),
    ]);
    let scanner = h
        .source("county scanner", SourceType::Audio, SourceCategory::Crime)
        .await;
    let news = h
        .source("local news", SourceType::Html, SourceCategory::News)
        .await;

    let when = at(2026, 7, 26, 2, 31);
    h.ingest(
        &scanner,
        &observation(
            "d-1",
            "shooting",
            "violent_crime",
            Some("Site A"),
            Some("Crystal Lake"),
            Some(when),
            0.80,
        ),
    )
    .await;
    h.ingest(
        &news,
        &observation(
            "d-2",
            "shooting",
            "violent_crime",
            Some("Site B"),
            Some("Crystal Lake"),
            Some(when + Duration::hours(1)),
            0.85,
        ),
    )
    .await;

    let incident = h
        .store
        .query_incidents(&IncidentFilter::default())
        .await
        .unwrap()
        .remove(0);
    assert_eq!(incident.report_count, 2);

    let rejected = h
        .store
        .review_incident(incident.id, ReviewAction::Reject, "operator")
        .await
        .unwrap();
    assert_eq!(rejected.review_status, ReviewStatus::Rejected);
    for report in h.store.reports_for_incident(incident.id).await.unwrap() {
        assert_eq!(report.dedup_status, DedupStatus::Rejected);
    }

    // A later matching report still links, and the recompute it triggers
    // must not overwrite the operator decision.
    let outcome = counts(
        h.ingest(
            &news,
            &observation(
                "d-3",
                "shooting",
                "violent_crime",
                Some("Site C"),
                Some("Crystal Lake"),
                Some(when + Duration::hours(2)),
                0.95,
            ),
        )
        .await,
    );
    assert_eq!(outcome.incidents_linked, 1);

    let after = h.store.incident(incident.id).await.unwrap().unwrap();
    assert_eq!(after.review_status, ReviewStatus::Rejected);
}

/// Scenario E: a block address interpolates to the centerline midpoint at
/// block confidence.
#[tokio::test]
async fn block_address_geocodes_to_centerline_midpoint() {
    let h = Harness::new(&[]);
    h.store
        .insert_centerlines(vec![StreetCenterline {
            id: Uuid::new_v4(),
            region: REGION.to_string(),
            street_name: "N MAIN ST".to_string(),
            street_name_normalized: "n main".to_string(),
            from_address: 1,
            to_address: 199,
            city: Some("Crystal Lake".to_string()),
            geometry: vec![
                GeoPoint {
                    lat: 42.2400,
                    lng: -88.3160,
                },
                GeoPoint {
                    lat: 42.2420,
                    lng: -88.3160,
                },
            ],
        }])
        .await
        .unwrap();

    let news = h
        .source("local news", SourceType::Html, SourceCategory::News)
        .await;
    h.ingest(
        &news,
        &observation(
            "e-1",
            "shots_fired",
            "violent_crime",
            Some("100 block of N Main St"),
            Some("Crystal Lake"),
            Some(at(2026, 7, 26, 2, 31)),
            0.80,
        ),
    )
    .await;

    let incident = h
        .store
        .query_incidents(&IncidentFilter::default())
        .await
        .unwrap()
        .remove(0);
    assert_eq!(incident.location_resolution, LocationResolution::Block);
    assert!((incident.location_confidence - 0.70).abs() < 1e-9);
    let point = incident.location.unwrap();
    assert!((point.lat - 42.2410).abs() < 1e-6);
    assert!((point.lng + 88.3160).abs() < 1e-6);
}

/// Property 1: re-ingesting the same observation is a no-op — no second
/// report row and no derived-field drift.
#[tokio::test]
async fn repeated_observation_is_idempotent() {
    let h = Harness::new(&[("Depot Ct", 42.2411, -88.3162)]);
    let news = h
        .source("local news", SourceType::Html, SourceCategory::News)
        .await;
    let obs = observation(
        "dup-1",
        "shooting",
        "violent_crime",
        Some("Depot Ct"),
        Some("Crystal Lake"),
        Some(at(2026, 7, 26, 2, 31)),
        0.80,
    );

    let first = counts(h.ingest(&news, &obs).await);
    assert_eq!(first.reports_created, 1);
    let before = h
        .store
        .query_incidents(&IncidentFilter::default())
        .await
        .unwrap()
        .remove(0);

    let second = counts(h.ingest(&news, &obs).await);
    assert_eq!(second.reports_created, 0);
    assert_eq!(second.reports_duplicate, 1);
    assert_eq!(second.incidents_created, 0);
    assert_eq!(second.incidents_linked, 0);

    let after = h
        .store
        .query_incidents(&IncidentFilter::default())
        .await
        .unwrap()
        .remove(0);
    assert_eq!(after.id, before.id);
    assert_eq!(after.report_count, before.report_count);
    assert_eq!(after.confidence_score, before.confidence_score);
    assert_eq!(after.review_status, before.review_status);
}

/// Malformed extractions (category outside the closed set) are dropped but
/// never crash the observation.
#[tokio::test]
async fn malformed_category_is_dropped() {
    let h = Harness::new(&[("Depot Ct", 42.2411, -88.3162)]);
    let news = h
        .source("local news", SourceType::Html, SourceCategory::News)
        .await;

    let outcome = counts(
        h.ingest(
            &news,
            &observation(
                "bad-1",
                "arson",
                "arson_crimes",
                Some("Depot Ct"),
                Some("Crystal Lake"),
                None,
                0.9,
            ),
        )
        .await,
    );
    assert_eq!(outcome.extractions_dropped, 1);
    assert_eq!(outcome.reports_created, 0);

    let incidents = h
        .store
        .query_incidents(&IncidentFilter::default())
        .await
        .unwrap();
    assert!(incidents.is_empty());
}

// --- Rollups (Scenario F plus idempotence) ---

async fn seed_incident(
    h: &Harness,
    source_id: Uuid,
    external_id: &str,
    category: IncidentCategory,
    city: &str,
    occurred_at: chrono::DateTime<Utc>,
    lat: f64,
) {
    let inserted = h
        .store
        .insert_report(NewReport {
            source_id,
            external_id: external_id.to_string(),
            source_url: "https://example.test/seed".to_string(),
            raw_text: "seed".to_string(),
            extracted: serde_json::json!({}),
            incident_type: "seeded".to_string(),
            category,
            address: None,
            city: Some(city.to_string()),
            location: Some(GeoPoint { lat, lng: -88.31 }),
            occurred_at: Some(occurred_at),
            extraction_model: "scripted-extractor".to_string(),
            extraction_confidence: 0.8,
            source_type: SourceType::Api,
        })
        .await
        .unwrap();
    let ReportInsert::Inserted(report) = inserted else {
        panic!("seed report duplicated");
    };
    h.store
        .create_incident_for_report(
            report.id,
            NewIncident {
                incident_type: "seeded".to_string(),
                category,
                urgency_score: 5,
                location: report.location,
                location_resolution: LocationResolution::Parcel,
                location_confidence: 0.95,
                address: None,
                city: Some(city.to_string()),
                region: REGION.to_string(),
                occurred_at: Some(occurred_at),
                title: "seeded".to_string(),
                description: "seeded".to_string(),
            },
        )
        .await
        .unwrap();
}

/// Scenario F: 10 incidents this week vs 8 last week is a +25% trend.
#[tokio::test]
async fn weekly_rollup_counts_and_trend() {
    let h = Harness::new(&[]);
    let api = h
        .source("county api", SourceType::Api, SourceCategory::Crime)
        .await;

    let week_start = NaiveDate::from_ymd_opt(2026, 7, 20).unwrap();
    let current = week_start.and_hms_opt(12, 0, 0).unwrap().and_utc();
    let previous = current - Duration::days(7);

    for i in 0..10 {
        seed_incident(
            &h,
            api.id,
            &format!("cur-{i}"),
            IncidentCategory::PropertyCrime,
            "Crystal Lake",
            current + Duration::hours(i),
            42.0 + i as f64 * 0.01,
        )
        .await;
    }
    for i in 0..8 {
        seed_incident(
            &h,
            api.id,
            &format!("prev-{i}"),
            IncidentCategory::PropertyCrime,
            "Crystal Lake",
            previous + Duration::hours(i),
            43.0 + i as f64 * 0.01,
        )
        .await;
    }

    let engine = RollupEngine::new(h.store.clone(), REGION);
    let rollups = engine.run_week(week_start).await.unwrap();

    let region_wide = rollups
        .iter()
        .find(|r| r.municipality.is_none())
        .expect("region-wide row");
    assert_eq!(region_wide.incident_count, 10);
    assert_eq!(
        region_wide.incidents_by_category["property_crime"],
        serde_json::json!(10)
    );
    assert_eq!(region_wide.incident_trend, 25);

    let municipal = rollups
        .iter()
        .find(|r| r.municipality.as_deref() == Some("Crystal Lake"))
        .expect("municipal row");
    assert_eq!(municipal.incident_count, 10);
    assert_eq!(municipal.incident_trend, 25);
}

/// Property 6: regenerating a rollup week yields identical rows.
#[tokio::test]
async fn rollup_regeneration_is_idempotent() {
    let h = Harness::new(&[]);
    let api = h
        .source("county api", SourceType::Api, SourceCategory::Crime)
        .await;

    let week_start = NaiveDate::from_ymd_opt(2026, 7, 20).unwrap();
    let current = week_start.and_hms_opt(9, 0, 0).unwrap().and_utc();
    for i in 0..3 {
        seed_incident(
            &h,
            api.id,
            &format!("r-{i}"),
            IncidentCategory::Traffic,
            "Cary",
            current + Duration::hours(i),
            42.0 + i as f64 * 0.01,
        )
        .await;
    }

    let engine = RollupEngine::new(h.store.clone(), REGION);
    let first = engine.run_week(week_start).await.unwrap();
    let second = engine.run_week(week_start).await.unwrap();

    let a = serde_json::to_value(&first).unwrap();
    let b = serde_json::to_value(&second).unwrap();
    assert_eq!(a, b);
}

/// News reports from news-category sources land in the rollup's news counts.
#[tokio::test]
async fn rollup_counts_news_reports_by_category() {
    let h = Harness::new(&[("Depot Ct", 42.2411, -88.3162)]);
    let news = h
        .source("local news", SourceType::Html, SourceCategory::News)
        .await;

    let week_start = NaiveDate::from_ymd_opt(2026, 7, 20).unwrap();
    let when = week_start.and_hms_opt(10, 0, 0).unwrap().and_utc();
    h.ingest(
        &news,
        &observation(
            "n-1",
            "burglary",
            "property_crime",
            Some("Depot Ct"),
            Some("Crystal Lake"),
            Some(when),
            0.9,
        ),
    )
    .await;

    let engine = RollupEngine::new(h.store.clone(), REGION);
    let rollups = engine.run_week(week_start).await.unwrap();
    let region_wide = rollups
        .iter()
        .find(|r| r.municipality.is_none())
        .expect("region-wide row");
    assert_eq!(region_wide.news_count, 1);
    assert_eq!(
        region_wide.news_by_category["property_crime"],
        serde_json::json!(1)
    );
}
