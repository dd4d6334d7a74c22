//! Weekly rollup aggregates: per-region and per-municipality counts with a
//! trend delta against the prior week. Upserts are keyed by
//! `(week_start, municipality)` and regenerating a week is byte-identical
//! for identical inputs.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc, Weekday};
use tracing::info;

use ranger_common::{
    Incident, IncidentCategory, IncidentReport, Result, ReviewStatus, WeeklyRollup,
};
use ranger_store::{IncidentStore, NewRollup};

/// Monday of the week containing `date`.
pub fn week_start_of(date: NaiveDate) -> NaiveDate {
    date - Duration::days(date.weekday().num_days_from_monday() as i64)
}

/// Integer percent change vs the prior week. A zero prior week reads as
/// +100% when anything happened, 0% otherwise.
pub fn trend(current: i64, previous: i64) -> i32 {
    if previous == 0 {
        return if current > 0 { 100 } else { 0 };
    }
    (100.0 * (current - previous) as f64 / previous as f64).round() as i32
}

fn category_counts<'a, I>(categories: I) -> Vec<(IncidentCategory, i64)>
where
    I: Iterator<Item = &'a IncidentCategory>,
{
    let mut counts = [0i64; IncidentCategory::ALL.len()];
    for category in categories {
        let idx = IncidentCategory::ALL
            .iter()
            .position(|c| c == category)
            .expect("category in closed set");
        counts[idx] += 1;
    }
    IncidentCategory::ALL
        .iter()
        .zip(counts)
        .filter(|(_, n)| *n > 0)
        .map(|(c, n)| (*c, n))
        .collect()
}

fn counts_json(counts: &[(IncidentCategory, i64)]) -> serde_json::Value {
    let mut map = serde_json::Map::new();
    for (category, n) in counts {
        map.insert(category.to_string(), serde_json::json!(n));
    }
    serde_json::Value::Object(map)
}

/// Deterministic human-readable summary; wording is stable for identical
/// counts so regeneration stays idempotent.
fn summary_text(
    week_start: NaiveDate,
    municipality: Option<&str>,
    incident_count: i64,
    by_category: &[(IncidentCategory, i64)],
    incident_trend: i32,
    news_count: i64,
) -> String {
    let scope = municipality.unwrap_or("region-wide");
    if incident_count == 0 {
        return format!(
            "Week of {week_start} ({scope}): no incidents. {news_count} news reports."
        );
    }
    let categories: Vec<String> = by_category
        .iter()
        .map(|(c, n)| format!("{c} {n}"))
        .collect();
    format!(
        "Week of {week_start} ({scope}): {incident_count} incidents ({trend:+}% vs prior week) — {cats}. {news_count} news reports.",
        trend = incident_trend,
        cats = categories.join(", "),
    )
}

pub struct RollupEngine {
    store: Arc<dyn IncidentStore>,
    region: String,
}

impl RollupEngine {
    pub fn new(store: Arc<dyn IncidentStore>, region: &str) -> Self {
        Self {
            store,
            region: region.to_string(),
        }
    }

    /// Regenerate rollups for the week containing `now` and the week before
    /// it (late-arriving reports shift last week's counts).
    pub async fn run(&self, now: DateTime<Utc>) -> Result<Vec<WeeklyRollup>> {
        let current = week_start_of(now.date_naive());
        let mut rollups = self.run_week(current - Duration::days(7)).await?;
        rollups.extend(self.run_week(current).await?);
        Ok(rollups)
    }

    /// Compute and upsert all rollup rows for one week: the region-wide row
    /// plus one row per municipality seen in the window.
    pub async fn run_week(&self, week_start: NaiveDate) -> Result<Vec<WeeklyRollup>> {
        debug_assert_eq!(week_start.weekday(), Weekday::Mon);

        let from = week_start.and_hms_opt(0, 0, 0).expect("midnight").and_utc();
        let to = from + Duration::days(7);
        let prev_from = from - Duration::days(7);

        let incidents = self.counted_incidents(from, to).await?;
        let previous = self.counted_incidents(prev_from, from).await?;
        let news = self
            .store
            .news_reports_between(&self.region, from, to)
            .await?;

        // Region-wide row plus one per municipality active this week.
        let mut municipalities: BTreeSet<Option<String>> = BTreeSet::new();
        municipalities.insert(None);
        municipalities.extend(incidents.iter().filter_map(|i| i.city.clone().map(Some)));
        municipalities.extend(news.iter().filter_map(|r| r.city.clone().map(Some)));

        let mut rollups = Vec::with_capacity(municipalities.len());
        for municipality in municipalities {
            let scoped_incidents: Vec<&Incident> = incidents
                .iter()
                .filter(|i| in_scope(i.city.as_deref(), municipality.as_deref()))
                .collect();
            let scoped_previous = previous
                .iter()
                .filter(|i| in_scope(i.city.as_deref(), municipality.as_deref()))
                .count() as i64;
            let scoped_news: Vec<&IncidentReport> = news
                .iter()
                .filter(|r| in_scope(r.city.as_deref(), municipality.as_deref()))
                .collect();

            let incident_count = scoped_incidents.len() as i64;
            let by_category = category_counts(scoped_incidents.iter().map(|i| &i.category));
            let news_by_category = category_counts(scoped_news.iter().map(|r| &r.category));
            let incident_trend = trend(incident_count, scoped_previous);

            let rollup = self
                .store
                .upsert_rollup(NewRollup {
                    week_start,
                    municipality: municipality.clone(),
                    incident_count,
                    incidents_by_category: counts_json(&by_category),
                    news_count: scoped_news.len() as i64,
                    news_by_category: counts_json(&news_by_category),
                    incident_trend,
                    summary_text: summary_text(
                        week_start,
                        municipality.as_deref(),
                        incident_count,
                        &by_category,
                        incident_trend,
                        scoped_news.len() as i64,
                    ),
                })
                .await?;
            rollups.push(rollup);
        }

        info!(
            region = self.region.as_str(),
            week_start = %week_start,
            rows = rollups.len(),
            "Weekly rollup written"
        );
        Ok(rollups)
    }

    /// Incidents that count toward aggregates: operator-rejected ones don't.
    async fn counted_incidents(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Incident>> {
        Ok(self
            .store
            .incidents_between(&self.region, from, to)
            .await?
            .into_iter()
            .filter(|i| i.review_status != ReviewStatus::Rejected)
            .collect())
    }
}

fn in_scope(city: Option<&str>, municipality: Option<&str>) -> bool {
    match municipality {
        None => true,
        Some(m) => city == Some(m),
    }
}
