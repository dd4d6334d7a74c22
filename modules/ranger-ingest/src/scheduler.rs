use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use tracing::{info, warn};
use uuid::Uuid;

use ranger_common::{Source, SourceType};

/// Default cadence for html/rss/api sources.
pub const DEFAULT_POLL_SECONDS: i64 = 900;

/// Backoff bounds in minutes; doubles per consecutive failure.
pub const BACKOFF_MIN_MINUTES: i64 = 1;
pub const BACKOFF_MAX_MINUTES: i64 = 64;

/// A source is deactivated after this many consecutive failed cycles.
pub const MAX_CONSECUTIVE_FAILURES: u32 = 10;

/// Poll interval for a source, from `config.poll_interval_s` when present.
pub fn poll_interval(source: &Source) -> Duration {
    let seconds = source
        .config
        .get("poll_interval_s")
        .and_then(|v| v.as_i64())
        .unwrap_or(DEFAULT_POLL_SECONDS);
    Duration::seconds(seconds.max(1))
}

/// What to do with a source after a failed cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDisposition {
    /// Retry after the given backoff.
    Backoff { minutes: i64, consecutive: u32 },
    /// Too many consecutive failures; the source must be deactivated.
    Deactivate,
}

#[derive(Debug)]
struct SourceState {
    next_fire_at: DateTime<Utc>,
    consecutive_failures: u32,
}

/// Decides which sources are due each cycle. Per-source state is in-memory;
/// a restart makes everything due immediately, which is safe because every
/// write downstream is idempotent.
pub struct SourceScheduler {
    states: HashMap<Uuid, SourceState>,
}

impl SourceScheduler {
    pub fn new() -> Self {
        Self {
            states: HashMap::new(),
        }
    }

    /// Sources due this cycle. Audio sources are never scheduled here; they
    /// run on their own dedicated streaming worker.
    pub fn due<'a>(&mut self, sources: &'a [Source], now: DateTime<Utc>) -> Vec<&'a Source> {
        let mut due = Vec::new();
        for source in sources {
            if source.source_type == SourceType::Audio {
                continue;
            }
            let state = self.states.entry(source.id).or_insert_with(|| SourceState {
                // Never-seen sources fire immediately, honouring a persisted
                // last_fetched_at from a prior process.
                next_fire_at: source
                    .last_fetched_at
                    .map(|t| t + poll_interval(source))
                    .unwrap_or(now),
                consecutive_failures: 0,
            });
            if now >= state.next_fire_at {
                due.push(source);
            }
        }
        due
    }

    pub fn record_success(&mut self, source: &Source, now: DateTime<Utc>) {
        let interval = poll_interval(source);
        let state = self.states.entry(source.id).or_insert_with(|| SourceState {
            next_fire_at: now,
            consecutive_failures: 0,
        });
        state.consecutive_failures = 0;
        state.next_fire_at = now + interval;
    }

    pub fn record_failure(&mut self, source: &Source, now: DateTime<Utc>) -> FailureDisposition {
        let state = self.states.entry(source.id).or_insert_with(|| SourceState {
            next_fire_at: now,
            consecutive_failures: 0,
        });
        state.consecutive_failures += 1;

        if state.consecutive_failures >= MAX_CONSECUTIVE_FAILURES {
            warn!(
                source = source.name.as_str(),
                failures = state.consecutive_failures,
                "Source exceeded failure limit, deactivating"
            );
            return FailureDisposition::Deactivate;
        }

        let minutes = (BACKOFF_MIN_MINUTES << (state.consecutive_failures - 1).min(6))
            .min(BACKOFF_MAX_MINUTES);
        state.next_fire_at = now + Duration::minutes(minutes);
        info!(
            source = source.name.as_str(),
            failures = state.consecutive_failures,
            backoff_minutes = minutes,
            "Source cycle failed, backing off"
        );
        FailureDisposition::Backoff {
            minutes,
            consecutive: state.consecutive_failures,
        }
    }

    /// Forget a deactivated source so a later reactivation starts clean.
    pub fn remove(&mut self, source_id: Uuid) {
        self.states.remove(&source_id);
    }
}

impl Default for SourceScheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ranger_common::SourceCategory;

    fn make_source(source_type: SourceType, last_fetched_at: Option<DateTime<Utc>>) -> Source {
        Source {
            id: Uuid::new_v4(),
            name: "test".to_string(),
            source_type,
            url: "https://example.test/feed".to_string(),
            region: "mchenry_county".to_string(),
            category: SourceCategory::News,
            municipality: None,
            config: serde_json::json!({}),
            is_active: true,
            reliability_score: 0.5,
            last_fetched_at,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn never_fetched_source_is_due_immediately() {
        let mut scheduler = SourceScheduler::new();
        let sources = vec![make_source(SourceType::Rss, None)];
        assert_eq!(scheduler.due(&sources, Utc::now()).len(), 1);
    }

    #[test]
    fn recently_fetched_source_waits_for_cadence() {
        let mut scheduler = SourceScheduler::new();
        let now = Utc::now();

        // Fetched 5 minutes ago with the 15-minute default: not due.
        let sources = vec![make_source(SourceType::Rss, Some(now - Duration::minutes(5)))];
        assert!(scheduler.due(&sources, now).is_empty());

        // Fetched 20 minutes ago: due.
        let sources = vec![make_source(SourceType::Rss, Some(now - Duration::minutes(20)))];
        assert_eq!(scheduler.due(&sources, now).len(), 1);
    }

    #[test]
    fn config_poll_interval_overrides_default() {
        let mut scheduler = SourceScheduler::new();
        let now = Utc::now();
        let mut source = make_source(SourceType::Api, Some(now - Duration::minutes(5)));
        source.config = serde_json::json!({"poll_interval_s": 60});
        let sources = vec![source];
        assert_eq!(scheduler.due(&sources, now).len(), 1);
    }

    #[test]
    fn audio_sources_are_not_cycle_scheduled() {
        let mut scheduler = SourceScheduler::new();
        let sources = vec![make_source(SourceType::Audio, None)];
        assert!(scheduler.due(&sources, Utc::now()).is_empty());
    }

    #[test]
    fn backoff_doubles_up_to_cap() {
        let mut scheduler = SourceScheduler::new();
        let source = make_source(SourceType::Html, None);
        let now = Utc::now();

        let expected = [1, 2, 4, 8, 16, 32, 64, 64, 64];
        for minutes in expected {
            match scheduler.record_failure(&source, now) {
                FailureDisposition::Backoff { minutes: m, .. } => assert_eq!(m, minutes),
                FailureDisposition::Deactivate => panic!("deactivated too early"),
            }
        }
        // Tenth consecutive failure deactivates.
        assert_eq!(
            scheduler.record_failure(&source, now),
            FailureDisposition::Deactivate
        );
    }

    #[test]
    fn success_resets_backoff() {
        let mut scheduler = SourceScheduler::new();
        let source = make_source(SourceType::Html, None);
        let now = Utc::now();

        for _ in 0..5 {
            scheduler.record_failure(&source, now);
        }
        scheduler.record_success(&source, now);
        match scheduler.record_failure(&source, now) {
            FailureDisposition::Backoff { minutes, consecutive } => {
                assert_eq!(minutes, 1);
                assert_eq!(consecutive, 1);
            }
            FailureDisposition::Deactivate => panic!("should back off"),
        }
    }

    #[test]
    fn source_not_due_during_backoff() {
        let mut scheduler = SourceScheduler::new();
        let source = make_source(SourceType::Html, None);
        let now = Utc::now();

        assert_eq!(scheduler.due(&[source.clone()], now).len(), 1);
        scheduler.record_failure(&source, now);

        let sources = vec![source];
        assert!(scheduler.due(&sources, now + Duration::seconds(30)).is_empty());
        assert_eq!(scheduler.due(&sources, now + Duration::minutes(2)).len(), 1);
    }
}
