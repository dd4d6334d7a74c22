use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use chrono::Utc;
use serde::Deserialize;
use sqlx::postgres::PgPoolOptions;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use ranger_common::{Config, GeoPoint, SourceType, StreetCenterline};
use ranger_ingest::adapters::audio::{AudioPipeline, HttpAudioFeed, HttpTranscriber};
use ranger_ingest::dedup::{DedupConfig, Deduplicator};
use ranger_ingest::extractor::ClaudeExtractor;
use ranger_ingest::geocoder::{self, CentroidTable, Geocoder, GeocodioClient};
use ranger_ingest::pipeline::{AudioWorker, Ingestor, Pipeline};
use ranger_ingest::rate_limit::RateLimits;
use ranger_ingest::rollup::RollupEngine;
use ranger_ingest::sources::{load_sources, sync_sources};
use ranger_store::{IncidentStore, PgStore};

#[derive(Parser)]
#[command(about = "Run the Ranger local-intelligence ingestion pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a single ingestion cycle and exit.
    Cycle,
    /// Run continuously: ingestion cycles, audio workers, periodic rollups.
    Run {
        /// Seconds between cycle ticks.
        #[arg(long, default_value_t = 60)]
        tick: u64,
    },
    /// Regenerate weekly rollups for the current and prior week.
    Rollup,
    /// Import street centerlines from a JSON file.
    ImportCenterlines { path: std::path::PathBuf },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("ranger=info".parse()?))
        .init();

    dotenv_load();
    let cli = Cli::parse();
    let config = Config::from_env();
    config.log_redacted();

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(10))
        .connect(&config.database_url)
        .await
        .context("Failed to connect to Postgres")?;
    let pg = PgStore::new(pool);
    pg.migrate().await?;
    let store: Arc<dyn IncidentStore> = Arc::new(pg);

    match cli.command {
        Command::Cycle => {
            let mut pipeline = build_pipeline(&config, store.clone()).await?;
            let stats = pipeline.run_cycle().await?;
            info!("{stats}");
        }
        Command::Run { tick } => {
            let mut pipeline = build_pipeline(&config, store.clone()).await?;
            spawn_audio_workers(&config, pipeline.ingestor().clone()).await?;

            let rollup = RollupEngine::new(store.clone(), &config.region);
            let mut last_rollup = Utc::now() - chrono::Duration::hours(7);

            loop {
                match pipeline.run_cycle().await {
                    Ok(stats) => info!("{stats}"),
                    Err(e) => warn!(error = %e, "Ingestion cycle failed"),
                }

                if Utc::now() - last_rollup >= chrono::Duration::hours(6) {
                    match rollup.run(Utc::now()).await {
                        Ok(rows) => {
                            last_rollup = Utc::now();
                            info!(rows = rows.len(), "Rollups regenerated");
                        }
                        Err(e) => warn!(error = %e, "Rollup regeneration failed"),
                    }
                }

                tokio::time::sleep(Duration::from_secs(tick)).await;
            }
        }
        Command::Rollup => {
            let rollup = RollupEngine::new(store, &config.region);
            let rows = rollup.run(Utc::now()).await?;
            info!(rows = rows.len(), "Rollups regenerated");
        }
        Command::ImportCenterlines { path } => {
            let count = import_centerlines(&store, &path).await?;
            info!(count, "Centerlines imported");
        }
    }

    Ok(())
}

async fn build_pipeline(config: &Config, store: Arc<dyn IncidentStore>) -> Result<Pipeline> {
    let entries = load_sources(&config.sources_path)?;
    sync_sources(&store, &entries).await?;

    let extractor = Arc::new(ClaudeExtractor::new(
        &config.anthropic_api_key,
        &config.extraction_model,
    ));

    let parcel = if config.geocode_api_key.is_empty() {
        warn!("GEOCODE_API_KEY not set; parcel tier disabled");
        None
    } else {
        Some(Arc::new(GeocodioClient::new(
            &config.geocode_base_url,
            &config.geocode_api_key,
            Duration::from_secs(10),
        )) as Arc<dyn geocoder::ParcelGeocoder>)
    };
    let geocoder = Geocoder::new(parcel, store.clone(), CentroidTable::mchenry_county());

    let dedup = Deduplicator::new(store.clone(), DedupConfig::default());
    let limits = Arc::new(RateLimits::new());

    let ingestor = Arc::new(Ingestor::new(
        store,
        extractor,
        geocoder,
        dedup,
        limits,
        &config.region,
        &config.data_dir,
    ));

    Ok(Pipeline::new(ingestor, config.fetch_concurrency))
}

/// One long-lived worker per active audio source.
async fn spawn_audio_workers(config: &Config, ingestor: Arc<Ingestor>) -> Result<()> {
    if config.transcribe_url.is_empty() {
        warn!("TRANSCRIBE_URL not set; audio sources disabled");
        return Ok(());
    }

    let audio_sources: Vec<_> = ingestor
        .store()
        .active_sources()
        .await?
        .into_iter()
        .filter(|s| s.source_type == SourceType::Audio)
        .collect();

    for source in audio_sources {
        let transcriber = Box::new(HttpTranscriber::new(
            &config.transcribe_url,
            Duration::from_secs(30),
        ));
        let worker = AudioWorker::new(
            ingestor.clone(),
            source.clone(),
            AudioPipeline::new(transcriber),
        );
        let url = source.url.clone();
        let name = source.name.clone();
        tokio::spawn(async move {
            loop {
                let feed = match HttpAudioFeed::connect(&url).await {
                    Ok(feed) => feed,
                    Err(e) => {
                        warn!(source = name.as_str(), error = %e, "Audio connect failed; retrying");
                        tokio::time::sleep(Duration::from_secs(30)).await;
                        continue;
                    }
                };
                match worker.run(Box::new(feed), Arc::new(AtomicBool::new(false))).await {
                    Ok(stats) => {
                        info!(
                            source = name.as_str(),
                            windows = stats.windows_seen,
                            triggered = stats.windows_triggered,
                            "Audio stream closed"
                        );
                    }
                    Err(e) => warn!(source = name.as_str(), error = %e, "Audio worker failed"),
                }
                break;
            }
        });
        info!(source = source.name.as_str(), "Audio worker spawned");
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
struct CenterlineImport {
    region: String,
    street_name: String,
    from_address: i32,
    to_address: i32,
    #[serde(default)]
    city: Option<String>,
    geometry: Vec<GeoPoint>,
}

async fn import_centerlines(
    store: &Arc<dyn IncidentStore>,
    path: &std::path::Path,
) -> Result<u64> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read centerline file: {}", path.display()))?;
    let imports: Vec<CenterlineImport> =
        serde_json::from_str(&content).context("Failed to parse centerline file")?;

    let lines: Vec<StreetCenterline> = imports
        .into_iter()
        .map(|i| StreetCenterline {
            id: Uuid::new_v4(),
            street_name_normalized: geocoder::normalize_street(&i.street_name),
            region: i.region,
            street_name: i.street_name,
            from_address: i.from_address,
            to_address: i.to_address,
            city: i.city,
            geometry: i.geometry,
        })
        .collect();

    Ok(store.insert_centerlines(lines).await?)
}

fn dotenv_load() {
    let path = std::path::Path::new(".env");
    if let Ok(content) = std::fs::read_to_string(path) {
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some((key, value)) = line.split_once('=') {
                if std::env::var(key.trim()).is_err() {
                    std::env::set_var(key.trim(), value.trim());
                }
            }
        }
    }
}
