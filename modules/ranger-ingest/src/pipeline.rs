//! The ingestion orchestrator: fetch -> extract -> geocode -> dedup -> store.
//!
//! One cycle drains leftover pending reports, fans due sources out over a
//! bounded worker pool, and feeds every observation through the shared
//! [`Ingestor`]. Audio sources stream through their own long-lived worker
//! using the same ingestor.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use tracing::{error, info, warn};

use ranger_common::{RangerError, Source, SourceType};
use ranger_store::{IncidentStore, ReportInsert};

use crate::adapters::audio::{AudioFeed, AudioPipeline, AudioStats};
use crate::adapters::{api::ApiAdapter, feed::FeedAdapter, html::HtmlAdapter};
use crate::adapters::{content_hash, RawObservation, SourceAdapter};
use crate::dedup::{DedupOutcome, Deduplicator};
use crate::extractor::{ExtractionHints, IncidentExtractor};
use crate::geocoder::Geocoder;
use crate::rate_limit::RateLimits;
use crate::run_log::{save_rejected_text, EventKind, RunLog};
use crate::scheduler::{FailureDisposition, SourceScheduler};

/// Stats from one ingestion cycle.
#[derive(Debug, Default, Clone)]
pub struct CycleStats {
    pub sources_due: usize,
    pub sources_ok: usize,
    pub sources_failed: usize,
    pub sources_deferred: usize,
    pub observations: usize,
    pub reports_created: usize,
    pub reports_duplicate: usize,
    pub incidents_created: usize,
    pub incidents_linked: usize,
    pub extractions_dropped: usize,
    pub pending_reprocessed: usize,
}

impl std::fmt::Display for CycleStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "\n=== Ingestion Cycle Complete ===")?;
        writeln!(f, "Sources due:        {}", self.sources_due)?;
        writeln!(f, "Sources ok:         {}", self.sources_ok)?;
        writeln!(f, "Sources failed:     {}", self.sources_failed)?;
        writeln!(f, "Sources deferred:   {}", self.sources_deferred)?;
        writeln!(f, "Observations:       {}", self.observations)?;
        writeln!(f, "Reports created:    {}", self.reports_created)?;
        writeln!(f, "Reports duplicate:  {}", self.reports_duplicate)?;
        writeln!(f, "Incidents created:  {}", self.incidents_created)?;
        writeln!(f, "Incidents linked:   {}", self.incidents_linked)?;
        writeln!(f, "Extractions dropped:{}", self.extractions_dropped)?;
        write!(f, "Pending reprocessed:{}", self.pending_reprocessed)
    }
}

/// Per-observation counters folded into [`CycleStats`].
#[derive(Debug, Default, Clone, Copy)]
pub struct ObservationCounts {
    pub reports_created: usize,
    pub reports_duplicate: usize,
    pub incidents_created: usize,
    pub incidents_linked: usize,
    pub extractions_dropped: usize,
}

/// Outcome of feeding one observation through extraction and linking.
#[derive(Debug)]
pub enum ObservationOutcome {
    Processed(ObservationCounts),
    /// LLM backpressure: nothing was consumed; the scheduler retries the
    /// source next cycle.
    Deferred,
}

/// Outcome of one source's cycle.
enum SourceCycle {
    Completed { observations: usize, counts: ObservationCounts },
    Deferred { observations: usize, counts: ObservationCounts },
}

/// The source-agnostic half of the pipeline: everything downstream of an
/// adapter. Shared between the cycle workers and the audio workers.
pub struct Ingestor {
    store: Arc<dyn IncidentStore>,
    extractor: Arc<dyn IncidentExtractor>,
    geocoder: Geocoder,
    dedup: Deduplicator,
    limits: Arc<RateLimits>,
    region: String,
    data_dir: std::path::PathBuf,
}

impl Ingestor {
    pub fn new(
        store: Arc<dyn IncidentStore>,
        extractor: Arc<dyn IncidentExtractor>,
        geocoder: Geocoder,
        dedup: Deduplicator,
        limits: Arc<RateLimits>,
        region: &str,
        data_dir: &std::path::Path,
    ) -> Self {
        Self {
            store,
            extractor,
            geocoder,
            dedup,
            limits,
            region: region.to_string(),
            data_dir: data_dir.to_path_buf(),
        }
    }

    pub fn store(&self) -> &Arc<dyn IncidentStore> {
        &self.store
    }

    /// Feed one observation through extract -> geocode -> insert -> dedup.
    ///
    /// Every write is idempotent, so a cancelled or repeated call cannot
    /// duplicate records: reports are keyed by `(source_id, external_id)`
    /// and linking only ever moves a report out of `pending` once.
    pub async fn ingest_observation(
        &self,
        source: &Source,
        obs: &RawObservation,
        log: &Mutex<RunLog>,
    ) -> Result<ObservationOutcome, RangerError> {
        if !self.limits.llm.try_acquire() {
            log.lock().expect("run log poisoned").log(EventKind::ExtractionDeferred {
                source: source.name.clone(),
            });
            return Ok(ObservationOutcome::Deferred);
        }

        let hints = ExtractionHints {
            region: source.region.clone(),
            source_type: source.source_type,
        };
        let batch = self
            .extractor
            .extract(&obs.raw_text, &hints)
            .await
            .map_err(|e| RangerError::Extraction(e.to_string()))?;

        let mut counts = ObservationCounts::default();

        // Malformed records are dropped; the raw text is kept on disk for
        // offline inspection.
        if !batch.dropped.is_empty() {
            counts.extractions_dropped = batch.dropped.len();
            let raw_path = save_rejected_text(&self.data_dir, &source.name, &obs.raw_text);
            let mut log = log.lock().expect("run log poisoned");
            for reason in &batch.dropped {
                log.log(EventKind::ExtractionRejected {
                    source: source.name.clone(),
                    reason: reason.clone(),
                    raw_path: raw_path.as_ref().map(|p| p.display().to_string()),
                });
            }
        }

        let multi = batch.candidates.len() > 1;
        for candidate in batch.candidates {
            let allow_parcel = self.limits.geocoder.try_acquire();
            let geocode = self
                .geocoder
                .geocode_with_budget(
                    candidate.address.as_deref(),
                    candidate.city.as_deref(),
                    &source.region,
                    allow_parcel,
                )
                .await;

            // One report per extracted incident. Multi-incident observations
            // get a content-derived suffix so each record keys stably.
            let external_id = if multi {
                format!(
                    "{}:{}",
                    obs.external_id,
                    content_hash(&format!(
                        "{}|{}|{}",
                        candidate.incident_type,
                        candidate.address.as_deref().unwrap_or(""),
                        candidate.title
                    ))
                )
            } else {
                obs.external_id.clone()
            };

            let mut extracted = candidate.payload.clone();
            if let Some(map) = extracted.as_object_mut() {
                map.insert(
                    "location_resolution".to_string(),
                    serde_json::json!(geocode.resolution.to_string()),
                );
                map.insert(
                    "location_confidence".to_string(),
                    serde_json::json!(geocode.confidence),
                );
            }

            let inserted = self
                .store
                .insert_report(ranger_store::NewReport {
                    source_id: source.id,
                    external_id: external_id.clone(),
                    source_url: obs.source_url.clone(),
                    raw_text: obs.raw_text.clone(),
                    extracted,
                    incident_type: candidate.incident_type.clone(),
                    category: candidate.category,
                    address: candidate.address.clone(),
                    city: candidate.city.clone(),
                    location: geocode.point,
                    occurred_at: candidate.occurred_at,
                    extraction_model: self.extractor.model().to_string(),
                    extraction_confidence: candidate.extraction_confidence,
                    source_type: source.source_type,
                })
                .await?;

            let report = match inserted {
                ReportInsert::Inserted(report) => report,
                ReportInsert::Duplicate => {
                    counts.reports_duplicate += 1;
                    log.lock().expect("run log poisoned").log(EventKind::ReportDuplicate {
                        source: source.name.clone(),
                        external_id,
                    });
                    continue;
                }
            };
            counts.reports_created += 1;
            log.lock().expect("run log poisoned").log(EventKind::ReportIngested {
                source: source.name.clone(),
                external_id,
                incident_type: report.incident_type.clone(),
                resolution: geocode.resolution.to_string(),
            });

            match self.dedup.process(&report, &source.region).await? {
                DedupOutcome::Linked {
                    incident,
                    score,
                    distance_m,
                } => {
                    counts.incidents_linked += 1;
                    log.lock().expect("run log poisoned").log(EventKind::ReportLinked {
                        report_id: report.id.to_string(),
                        incident_id: incident.id.to_string(),
                        score,
                        distance_m,
                    });
                }
                DedupOutcome::Created(incident) => {
                    counts.incidents_created += 1;
                    log.lock().expect("run log poisoned").log(EventKind::IncidentCreated {
                        incident_id: incident.id.to_string(),
                        incident_type: incident.incident_type.clone(),
                        review_status: incident.review_status.to_string(),
                    });
                }
            }
        }

        Ok(ObservationOutcome::Processed(counts))
    }

    /// Drain reports a previous cycle persisted but never linked (the
    /// cancellation-safe half of the ingest contract).
    pub async fn process_pending(&self, log: &Mutex<RunLog>) -> Result<usize, RangerError> {
        let pending = self.store.pending_reports(500).await?;
        let mut processed = 0usize;
        for report in pending {
            match self.dedup.process(&report, &self.region).await {
                Ok(outcome) => {
                    processed += 1;
                    let mut log = log.lock().expect("run log poisoned");
                    match outcome {
                        DedupOutcome::Linked {
                            incident,
                            score,
                            distance_m,
                        } => log.log(EventKind::ReportLinked {
                            report_id: report.id.to_string(),
                            incident_id: incident.id.to_string(),
                            score,
                            distance_m,
                        }),
                        DedupOutcome::Created(incident) => log.log(EventKind::IncidentCreated {
                            incident_id: incident.id.to_string(),
                            incident_type: incident.incident_type.clone(),
                            review_status: incident.review_status.to_string(),
                        }),
                    }
                }
                Err(e) => warn!(report_id = %report.id, error = %e, "Pending report reprocess failed"),
            }
        }
        Ok(processed)
    }
}

/// The scheduled half: adapters plus the per-source scheduler.
pub struct Pipeline {
    ingestor: Arc<Ingestor>,
    scheduler: SourceScheduler,
    feed: FeedAdapter,
    html: HtmlAdapter,
    api: ApiAdapter,
    concurrency: usize,
}

impl Pipeline {
    pub fn new(ingestor: Arc<Ingestor>, concurrency: usize) -> Self {
        let timeout = std::time::Duration::from_secs(10);
        Self {
            ingestor,
            scheduler: SourceScheduler::new(),
            feed: FeedAdapter::new(timeout),
            html: HtmlAdapter::new(timeout),
            api: ApiAdapter::new(timeout),
            concurrency: concurrency.max(1),
        }
    }

    pub fn ingestor(&self) -> &Arc<Ingestor> {
        &self.ingestor
    }

    fn adapter_for(&self, source_type: SourceType) -> Option<&dyn SourceAdapter> {
        match source_type {
            SourceType::Rss => Some(&self.feed),
            SourceType::Html => Some(&self.html),
            SourceType::Api => Some(&self.api),
            // Audio streams on its own worker; manual entries arrive through
            // operator tooling, not a fetch.
            SourceType::Audio | SourceType::Manual => None,
        }
    }

    /// Run one ingestion cycle over every due source.
    pub async fn run_cycle(&mut self) -> Result<CycleStats> {
        let now = Utc::now();
        let store = self.ingestor.store().clone();
        let sources = store.active_sources().await?;
        let due: Vec<Source> = self
            .scheduler
            .due(&sources, now)
            .into_iter()
            .cloned()
            .collect();

        let log = Mutex::new(RunLog::new(&self.ingestor.region));
        let mut stats = CycleStats {
            sources_due: due.len(),
            ..CycleStats::default()
        };

        stats.pending_reprocessed = self.ingestor.process_pending(&log).await?;
        log.lock().expect("run log poisoned").log(EventKind::CycleStarted {
            due_sources: due.len(),
            pending_reports: stats.pending_reprocessed,
        });

        info!(
            due = due.len(),
            pending = stats.pending_reprocessed,
            "Ingestion cycle starting"
        );

        let this = &*self;
        let results: Vec<(Source, Result<SourceCycle, RangerError>)> =
            stream::iter(due.into_iter().map(|source| {
                let log = &log;
                async move {
                    let outcome = this.process_source(&source, log).await;
                    (source, outcome)
                }
            }))
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        for (source, outcome) in results {
            match outcome {
                Ok(SourceCycle::Completed { observations, counts }) => {
                    stats.sources_ok += 1;
                    stats.observations += observations;
                    fold(&mut stats, counts);
                    self.scheduler.record_success(&source, Utc::now());
                    store.mark_fetched(source.id, Utc::now()).await?;
                    log.lock().expect("run log poisoned").log(EventKind::SourceFetched {
                        source: source.name.clone(),
                        observations,
                    });
                }
                Ok(SourceCycle::Deferred { observations, counts }) => {
                    // Backpressure, not failure: the source stays due and
                    // keeps its failure count.
                    stats.sources_deferred += 1;
                    stats.observations += observations;
                    fold(&mut stats, counts);
                }
                Err(e) => {
                    stats.sources_failed += 1;
                    match self.scheduler.record_failure(&source, Utc::now()) {
                        FailureDisposition::Backoff { consecutive, .. } => {
                            log.lock().expect("run log poisoned").log(EventKind::SourceFailed {
                                source: source.name.clone(),
                                category: "transient",
                                error: e.to_string(),
                                consecutive_failures: consecutive,
                            });
                        }
                        FailureDisposition::Deactivate => {
                            error!(source = source.name.as_str(), error = %e, "Deactivating source");
                            store.set_source_active(source.id, false).await?;
                            self.scheduler.remove(source.id);
                            let mut log = log.lock().expect("run log poisoned");
                            log.log(EventKind::SourceFailed {
                                source: source.name.clone(),
                                category: "fatal",
                                error: e.to_string(),
                                consecutive_failures: crate::scheduler::MAX_CONSECUTIVE_FAILURES,
                            });
                            log.log(EventKind::SourceDeactivated {
                                source: source.name.clone(),
                            });
                        }
                    }
                }
            }
        }

        if let Err(e) = log
            .into_inner()
            .expect("run log poisoned")
            .save(&self.ingestor.data_dir)
        {
            warn!(error = %e, "Failed to save run log");
        }

        Ok(stats)
    }

    /// Fetch one source and push its observations through the ingestor in
    /// adapter order. A whole-adapter failure propagates; per-observation
    /// extraction failures skip the item.
    async fn process_source(
        &self,
        source: &Source,
        log: &Mutex<RunLog>,
    ) -> Result<SourceCycle, RangerError> {
        let Some(adapter) = self.adapter_for(source.source_type) else {
            return Ok(SourceCycle::Completed {
                observations: 0,
                counts: ObservationCounts::default(),
            });
        };

        let observations = adapter.fetch(source).await.map_err(|e| RangerError::Fetch {
            source_name: source.name.clone(),
            message: format!("{e:#}"),
        })?;

        let total = observations.len();
        let mut counts = ObservationCounts::default();
        for obs in &observations {
            match self.ingestor.ingest_observation(source, obs, log).await {
                Ok(ObservationOutcome::Processed(c)) => {
                    counts.reports_created += c.reports_created;
                    counts.reports_duplicate += c.reports_duplicate;
                    counts.incidents_created += c.incidents_created;
                    counts.incidents_linked += c.incidents_linked;
                    counts.extractions_dropped += c.extractions_dropped;
                }
                Ok(ObservationOutcome::Deferred) => {
                    // Stop here; remaining observations are refetched next
                    // cycle and dedup makes the replay harmless.
                    return Ok(SourceCycle::Deferred {
                        observations: total,
                        counts,
                    });
                }
                Err(e) => {
                    warn!(
                        source = source.name.as_str(),
                        error = %e,
                        "Observation failed, skipping item"
                    );
                }
            }
        }

        Ok(SourceCycle::Completed {
            observations: total,
            counts,
        })
    }
}

fn fold(stats: &mut CycleStats, counts: ObservationCounts) {
    stats.reports_created += counts.reports_created;
    stats.reports_duplicate += counts.reports_duplicate;
    stats.incidents_created += counts.incidents_created;
    stats.incidents_linked += counts.incidents_linked;
    stats.extractions_dropped += counts.extractions_dropped;
}

// --- Audio worker ---

/// Dedicated streaming worker for one audio source. Windows run through the
/// trigger model; the rare triggered window feeds the shared ingestor.
pub struct AudioWorker {
    ingestor: Arc<Ingestor>,
    source: Source,
    audio: AudioPipeline,
}

impl AudioWorker {
    pub fn new(ingestor: Arc<Ingestor>, source: Source, audio: AudioPipeline) -> Self {
        Self {
            ingestor,
            source,
            audio,
        }
    }

    pub async fn run(
        mut self,
        mut feed: Box<dyn AudioFeed>,
        cancelled: Arc<AtomicBool>,
    ) -> Result<AudioStats> {
        let log = Mutex::new(RunLog::new(&self.source.region));

        while !cancelled.load(Ordering::Relaxed) {
            let Some(window) = feed.next_window().await? else {
                info!(source = self.source.name.as_str(), "Audio stream ended");
                break;
            };

            let Some(obs) = self
                .audio
                .process_window(&self.source.url, &window)
                .await?
            else {
                continue;
            };

            // Deferred means LLM backpressure; wait out the bucket once
            // rather than dropping a triggered dispatch.
            let mut attempts = 0;
            loop {
                match self
                    .ingestor
                    .ingest_observation(&self.source, &obs, &log)
                    .await
                {
                    Ok(ObservationOutcome::Processed(_)) => break,
                    Ok(ObservationOutcome::Deferred) if attempts < 3 => {
                        attempts += 1;
                        tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                    }
                    Ok(ObservationOutcome::Deferred) => {
                        warn!(
                            source = self.source.name.as_str(),
                            "Dropping triggered window after sustained backpressure"
                        );
                        break;
                    }
                    Err(e) => {
                        warn!(source = self.source.name.as_str(), error = %e, "Audio observation failed");
                        break;
                    }
                }
            }
        }

        if let Err(e) = log
            .into_inner()
            .expect("run log poisoned")
            .save(&self.ingestor.data_dir)
        {
            warn!(error = %e, "Failed to save audio run log");
        }
        Ok(self.audio.stats().clone())
    }
}
