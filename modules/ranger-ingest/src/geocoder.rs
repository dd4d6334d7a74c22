//! Three-tier geocoding: parcel lookup, block interpolation against street
//! centerlines, then city/region centroid. "Somewhere in the right place"
//! beats dropping the record, so the resolution tier travels with the result
//! and callers filter by confidence.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use tracing::{debug, warn};

use ranger_common::{GeoPoint, LocationResolution};
use ranger_store::IncidentStore;

pub const PARCEL_CONFIDENCE: f64 = 0.95;
pub const BLOCK_CONFIDENCE: f64 = 0.70;
pub const CENTROID_CONFIDENCE: f64 = 0.30;

/// Provider accuracy below this is treated as a parcel miss.
const PARCEL_MIN_ACCURACY: f64 = 0.8;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeocodeResult {
    pub point: Option<GeoPoint>,
    pub resolution: LocationResolution,
    pub confidence: f64,
}

impl GeocodeResult {
    fn miss() -> Self {
        Self {
            point: None,
            resolution: LocationResolution::Unknown,
            confidence: 0.0,
        }
    }
}

/// External exact-address lookup (tier 1).
#[async_trait]
pub trait ParcelGeocoder: Send + Sync {
    async fn lookup(&self, address: &str, city: Option<&str>) -> Result<Option<GeoPoint>>;
}

/// Geocodio-style HTTP parcel geocoder.
pub struct GeocodioClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl GeocodioClient {
    pub fn new(base_url: &str, api_key: &str, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .expect("Failed to build geocoder HTTP client"),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct GeocodioResponse {
    #[serde(default)]
    results: Vec<GeocodioResult>,
}

#[derive(Debug, Deserialize)]
struct GeocodioResult {
    #[serde(default)]
    accuracy: f64,
    location: GeocodioLocation,
}

#[derive(Debug, Deserialize)]
struct GeocodioLocation {
    lat: f64,
    lng: f64,
}

#[async_trait]
impl ParcelGeocoder for GeocodioClient {
    async fn lookup(&self, address: &str, city: Option<&str>) -> Result<Option<GeoPoint>> {
        let q = match city {
            Some(city) => format!("{address}, {city}"),
            None => address.to_string(),
        };

        let response: GeocodioResponse = self
            .client
            .get(format!("{}/geocode", self.base_url))
            .query(&[("q", q.as_str()), ("api_key", self.api_key.as_str())])
            .send()
            .await
            .context("Parcel geocoder request failed")?
            .error_for_status()
            .context("Parcel geocoder returned error status")?
            .json()
            .await
            .context("Malformed parcel geocoder response")?;

        Ok(response
            .results
            .into_iter()
            .find(|r| r.accuracy >= PARCEL_MIN_ACCURACY)
            .map(|r| GeoPoint {
                lat: r.location.lat,
                lng: r.location.lng,
            }))
    }
}

// --- Block address parsing ---

/// Street-type suffixes stripped when normalizing names for centerline
/// matching.
const STREET_TYPE_TOKENS: &[&str] = &[
    "st",
    "street",
    "ave",
    "avenue",
    "rd",
    "road",
    "dr",
    "drive",
    "ln",
    "lane",
    "ct",
    "court",
    "blvd",
    "boulevard",
];

/// Lowercase a street name and strip trailing type tokens:
/// "N Main St" -> "n main".
pub fn normalize_street(name: &str) -> String {
    let mut tokens: Vec<String> = name
        .split_whitespace()
        .map(|t| t.trim_matches(|c: char| !c.is_alphanumeric()).to_lowercase())
        .filter(|t| !t.is_empty())
        .collect();
    while let Some(last) = tokens.last() {
        if STREET_TYPE_TOKENS.contains(&last.as_str()) {
            tokens.pop();
        } else {
            break;
        }
    }
    tokens.join(" ")
}

/// Parse "`<number>` block (of) `<street>`" into (block number, normalized
/// street name).
pub fn parse_block_address(address: &str) -> Option<(i32, String)> {
    // Compiled on demand; block parsing is not on a hot path.
    let pattern =
        Regex::new(r"(?i)(\d+)\s*block(?:\s+of)?\s+(.+)").expect("block address regex");
    let captures = pattern.captures(address)?;
    let number: i32 = captures.get(1)?.as_str().parse().ok()?;
    let street = normalize_street(captures.get(2)?.as_str());
    (!street.is_empty()).then_some((number, street))
}

// --- Centroid table (tier 3) ---

/// Known municipal centroids plus a region-wide fallback.
#[derive(Debug, Clone)]
pub struct CentroidTable {
    entries: HashMap<String, GeoPoint>,
}

impl CentroidTable {
    pub fn new(entries: HashMap<String, GeoPoint>) -> Self {
        Self { entries }
    }

    /// The McHenry County deployment's centroid set.
    pub fn mchenry_county() -> Self {
        let raw = [
            ("crystal lake", 42.2411, -88.3162),
            ("mchenry", 42.3336, -88.2668),
            ("woodstock", 42.3147, -88.4487),
            ("cary", 42.2120, -88.2378),
            ("algonquin", 42.1656, -88.2945),
            ("lake in the hills", 42.1828, -88.3310),
            ("huntley", 42.1681, -88.4281),
            ("harvard", 42.4222, -88.6145),
            ("marengo", 42.2495, -88.6084),
            ("mchenry county", 42.3239, -88.4506),
        ];
        Self::new(
            raw.into_iter()
                .map(|(name, lat, lng)| (name.to_string(), GeoPoint { lat, lng }))
                .collect(),
        )
    }

    /// City centroid first, then the region itself (underscores read as
    /// spaces, so region "mchenry_county" matches "mchenry county").
    pub fn lookup(&self, city: Option<&str>, region: &str) -> Option<GeoPoint> {
        if let Some(city) = city {
            if let Some(point) = self.entries.get(&city.trim().to_lowercase()) {
                return Some(*point);
            }
        }
        self.entries
            .get(&region.trim().to_lowercase().replace('_', " "))
            .copied()
    }
}

// --- Geocoder ---

pub struct Geocoder {
    parcel: Option<Arc<dyn ParcelGeocoder>>,
    store: Arc<dyn IncidentStore>,
    centroids: CentroidTable,
}

impl Geocoder {
    pub fn new(
        parcel: Option<Arc<dyn ParcelGeocoder>>,
        store: Arc<dyn IncidentStore>,
        centroids: CentroidTable,
    ) -> Self {
        Self {
            parcel,
            store,
            centroids,
        }
    }

    /// Resolve an address to a point. The first tier that yields a match
    /// wins; a provider failure falls through to the next tier rather than
    /// failing the record.
    pub async fn geocode(
        &self,
        address: Option<&str>,
        city: Option<&str>,
        region: &str,
    ) -> GeocodeResult {
        self.geocode_with_budget(address, city, region, true).await
    }

    /// Like [`Self::geocode`], but the caller can withhold the parcel tier
    /// when the provider's token bucket is empty; the lower tiers still run.
    pub async fn geocode_with_budget(
        &self,
        address: Option<&str>,
        city: Option<&str>,
        region: &str,
        allow_parcel: bool,
    ) -> GeocodeResult {
        let block = address.and_then(parse_block_address);

        // Tier 1: parcel lookup for exact addresses. Block-style addresses
        // are not parcels; they go straight to interpolation.
        if block.is_none() && allow_parcel {
            if let (Some(address), Some(parcel)) = (address, &self.parcel) {
                match parcel.lookup(address, city).await {
                    Ok(Some(point)) => {
                        return GeocodeResult {
                            point: Some(point),
                            resolution: LocationResolution::Parcel,
                            confidence: PARCEL_CONFIDENCE,
                        }
                    }
                    Ok(None) => debug!(address, "No parcel match"),
                    Err(e) => warn!(address, error = %e, "Parcel lookup failed"),
                }
            }
        }

        // Tier 2: block interpolation against centerlines.
        if let Some((number, street)) = block {
            match self
                .store
                .centerlines_spanning(region, &street, number)
                .await
            {
                Ok(lines) => {
                    if let Some(point) = lines.first().and_then(|line| line.midpoint()) {
                        return GeocodeResult {
                            point: Some(point),
                            resolution: LocationResolution::Block,
                            confidence: BLOCK_CONFIDENCE,
                        };
                    }
                    debug!(street = street.as_str(), number, "No centerline spans block");
                }
                Err(e) => warn!(street = street.as_str(), error = %e, "Centerline query failed"),
            }
        }

        // Tier 3: city or region centroid.
        if let Some(point) = self.centroids.lookup(city, region) {
            return GeocodeResult {
                point: Some(point),
                resolution: LocationResolution::Centroid,
                confidence: CENTROID_CONFIDENCE,
            };
        }

        GeocodeResult::miss()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ranger_store::MemoryStore;
    use uuid::Uuid;

    #[test]
    fn street_normalization_strips_trailing_type_tokens() {
        assert_eq!(normalize_street("N Main St"), "n main");
        assert_eq!(normalize_street("OAK AVENUE"), "oak");
        assert_eq!(normalize_street("Lake Shore Drive"), "lake shore");
        assert_eq!(normalize_street("St. Charles Rd"), "st charles");
        assert_eq!(normalize_street("Main"), "main");
    }

    #[test]
    fn block_address_parsing() {
        assert_eq!(
            parse_block_address("100 block of N Main St"),
            Some((100, "n main".to_string()))
        );
        assert_eq!(
            parse_block_address("1200 BLOCK MAIN STREET"),
            Some((1200, "main".to_string()))
        );
        assert_eq!(parse_block_address("214 W Judd St"), None);
        assert_eq!(parse_block_address(""), None);
    }

    #[test]
    fn centroid_lookup_prefers_city_then_region() {
        let table = CentroidTable::mchenry_county();
        let city = table.lookup(Some("Crystal Lake"), "mchenry_county").unwrap();
        assert!((city.lat - 42.2411).abs() < 1e-9);

        let region = table.lookup(Some("Springfield"), "mchenry_county").unwrap();
        assert!((region.lat - 42.3239).abs() < 1e-9);

        assert_eq!(table.lookup(None, "cook_county"), None);
    }

    #[test]
    fn tier_confidences_are_non_increasing() {
        let tiers = [PARCEL_CONFIDENCE, BLOCK_CONFIDENCE, CENTROID_CONFIDENCE, 0.0];
        assert!(tiers.windows(2).all(|w| w[0] >= w[1]));
    }

    struct FixedParcel(Option<GeoPoint>);

    #[async_trait]
    impl ParcelGeocoder for FixedParcel {
        async fn lookup(&self, _address: &str, _city: Option<&str>) -> Result<Option<GeoPoint>> {
            Ok(self.0)
        }
    }

    async fn store_with_centerline() -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        store
            .insert_centerlines(vec![ranger_common::StreetCenterline {
                id: Uuid::new_v4(),
                region: "mchenry_county".to_string(),
                street_name: "N MAIN ST".to_string(),
                street_name_normalized: "n main".to_string(),
                from_address: 1,
                to_address: 199,
                city: Some("Crystal Lake".to_string()),
                geometry: vec![
                    GeoPoint { lat: 42.2400, lng: -88.3160 },
                    GeoPoint { lat: 42.2420, lng: -88.3160 },
                ],
            }])
            .await
            .unwrap();
        store
    }

    fn fixed_parcel(point: Option<GeoPoint>) -> Option<Arc<dyn ParcelGeocoder>> {
        Some(Arc::new(FixedParcel(point)))
    }

    #[tokio::test]
    async fn block_address_interpolates_centerline_midpoint() {
        let store = store_with_centerline().await;
        let geocoder = Geocoder::new(
            fixed_parcel(Some(GeoPoint { lat: 0.0, lng: 0.0 })),
            store,
            CentroidTable::mchenry_county(),
        );

        let result = geocoder
            .geocode(Some("100 block of N Main St"), Some("Crystal Lake"), "mchenry_county")
            .await;
        assert_eq!(result.resolution, LocationResolution::Block);
        assert!((result.confidence - BLOCK_CONFIDENCE).abs() < 1e-9);
        let point = result.point.unwrap();
        assert!((point.lat - 42.2410).abs() < 1e-6);
        assert!((point.lng + 88.3160).abs() < 1e-6);
    }

    #[tokio::test]
    async fn exact_address_uses_parcel_tier() {
        let store = store_with_centerline().await;
        let geocoder = Geocoder::new(
            fixed_parcel(Some(GeoPoint {
                lat: 42.2455,
                lng: -88.3199,
            })),
            store,
            CentroidTable::mchenry_county(),
        );

        let result = geocoder
            .geocode(Some("214 W Judd St"), Some("Woodstock"), "mchenry_county")
            .await;
        assert_eq!(result.resolution, LocationResolution::Parcel);
        assert!((result.confidence - PARCEL_CONFIDENCE).abs() < 1e-9);
    }

    #[tokio::test]
    async fn falls_back_to_centroid_then_unknown() {
        let store = Arc::new(MemoryStore::new());
        let geocoder = Geocoder::new(
            fixed_parcel(None),
            store.clone(),
            CentroidTable::mchenry_county(),
        );

        let result = geocoder
            .geocode(Some("somewhere vague"), Some("Cary"), "mchenry_county")
            .await;
        assert_eq!(result.resolution, LocationResolution::Centroid);
        assert!((result.confidence - CENTROID_CONFIDENCE).abs() < 1e-9);

        let result = geocoder.geocode(None, None, "elsewhere_county").await;
        assert_eq!(result.resolution, LocationResolution::Unknown);
        assert_eq!(result.point, None);
        assert_eq!(result.confidence, 0.0);
    }
}
