//! Context Store boundary and the in-process measurement index

use crate::error::StoreError;
use crate::scoring::{cosine_similarity, haversine_km, proximity_score};
use crate::types::{DateRange, FragmentKind};
use crate::vocabulary::{identify_region, parameter_by_name, region_by_name};
use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock};

/// Structured constraints on measurement records
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RecordFilter {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date_range: Option<DateRange>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub parameters: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub float_id: Option<String>,
}

impl RecordFilter {
    pub fn facet_count(&self) -> usize {
        self.date_range.is_some() as usize
            + !self.parameters.is_empty() as usize
            + self.region.is_some() as usize
            + self.float_id.is_some() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.facet_count() == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
}

/// One match reported by a store
#[derive(Debug, Clone, PartialEq)]
pub struct StoreHit {
    pub source_id: String,
    pub kind: FragmentKind,
    /// km for proximity queries, 1 - cosine for vector queries, 0 for filters
    pub distance: f32,
    /// In [0, 1]; proximity for spatial queries, cosine for vector queries
    pub similarity: f32,
    /// Fraction of filter facets the record satisfies
    pub exactness: f32,
    pub payload: String,
}

#[derive(Debug, Clone, Default)]
pub struct StoreHits {
    pub hits: Vec<StoreHit>,
    /// Number of qualifying records before the limit was applied
    pub total_matches: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub record_count: usize,
    pub last_refresh: Option<DateTime<Utc>>,
    pub connections: usize,
    pub healthy: bool,
}

/// Queryable index over measurement records and their embeddings
#[async_trait]
pub trait ContextStore: Send + Sync {
    fn name(&self) -> &str;

    /// Records within `radius_km` of `center`, closest first
    async fn nearest(
        &self,
        center: GeoPoint,
        radius_km: f64,
        filter: &RecordFilter,
        limit: usize,
    ) -> Result<StoreHits, StoreError>;

    /// Records satisfying every facet of `filter`
    async fn filter(&self, filter: &RecordFilter, limit: usize) -> Result<StoreHits, StoreError>;

    /// Top-k records by vector similarity; `filter` facets are soft and
    /// reported through `exactness`
    async fn similar(
        &self,
        text: &str,
        filter: &RecordFilter,
        k: usize,
    ) -> Result<StoreHits, StoreError>;

    async fn stats(&self) -> Result<StoreStats, StoreError>;
}

/// Text embedding capability
pub trait Embedder: Send + Sync {
    fn model_name(&self) -> &str;
    fn dims(&self) -> usize;
    fn embed(&self, text: &str) -> Vec<f32>;
}

/// Feature-hashing bag-of-words embedder. Parameter aliases are folded to
/// their canonical names so "oxygen" and "DOXY" land on the same feature.
pub struct HashingEmbedder {
    dims: usize,
}

impl HashingEmbedder {
    pub fn new(dims: usize) -> Self {
        Self { dims: dims.max(8) }
    }
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl Embedder for HashingEmbedder {
    fn model_name(&self) -> &str {
        "hashing-bow"
    }

    fn dims(&self) -> usize {
        self.dims
    }

    fn embed(&self, text: &str) -> Vec<f32> {
        let mut vec = vec![0.0f32; self.dims];
        let lowered = text.to_lowercase();
        for token in lowered
            .split(|c: char| !(c.is_alphanumeric() || c == '_'))
            .filter(|t| t.len() > 1)
        {
            let feature = parameter_by_name(token)
                .map(|p| p.name.to_lowercase())
                .unwrap_or_else(|| token.to_string());
            let mut hasher = DefaultHasher::new();
            feature.hash(&mut hasher);
            let h = hasher.finish();
            let idx = (h % self.dims as u64) as usize;
            let sign = if (h >> 63) == 0 { 1.0 } else { -1.0 };
            vec[idx] += sign;
        }
        let norm = vec.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > f32::EPSILON {
            for x in vec.iter_mut() {
                *x /= norm;
            }
        }
        vec
    }
}

/// A profile or aggregate produced by the ingestion pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasurementRecord {
    pub id: String,
    pub float_id: String,
    #[serde(default)]
    pub cycle: Option<u32>,
    pub lat: f64,
    pub lon: f64,
    pub date: NaiveDate,
    #[serde(default)]
    pub region: Option<String>,
    /// Parameter name to value, kept exactly as ingestion reported it
    pub measurements: BTreeMap<String, String>,
    #[serde(default = "default_record_kind")]
    pub kind: FragmentKind,
}

fn default_record_kind() -> FragmentKind {
    FragmentKind::Record
}

impl MeasurementRecord {
    pub fn region_name(&self) -> &str {
        self.region
            .as_deref()
            .unwrap_or_else(|| identify_region(self.lat, self.lon))
    }

    pub fn in_region(&self, region: &str) -> bool {
        match region_by_name(region) {
            Some(r) => r.contains(self.lat, self.lon),
            None => self.region_name().eq_ignore_ascii_case(region),
        }
    }

    pub fn measures_any(&self, parameters: &[String]) -> bool {
        parameters.iter().any(|wanted| {
            self.measurements
                .keys()
                .any(|have| have.eq_ignore_ascii_case(wanted))
        })
    }

    fn facets_matched(&self, filter: &RecordFilter) -> usize {
        let mut matched = 0;
        if let Some(range) = &filter.date_range {
            matched += range.contains(self.date) as usize;
        }
        if !filter.parameters.is_empty() {
            matched += self.measures_any(&filter.parameters) as usize;
        }
        if let Some(region) = &filter.region {
            matched += self.in_region(region) as usize;
        }
        if let Some(float_id) = &filter.float_id {
            matched += (&self.float_id == float_id) as usize;
        }
        matched
    }

    pub fn matches(&self, filter: &RecordFilter) -> bool {
        self.facets_matched(filter) == filter.facet_count()
    }

    /// Text shown to the generator; measurement values are copied as stored.
    pub fn render(&self) -> String {
        let mut out = format!("Float {}", self.float_id);
        if let Some(cycle) = self.cycle {
            out.push_str(&format!(" cycle {}", cycle));
        }
        out.push_str(&format!(
            " at {}, {} on {} ({})",
            format_lat(self.lat),
            format_lon(self.lon),
            self.date,
            self.region_name()
        ));
        if !self.measurements.is_empty() {
            let values: Vec<String> = self
                .measurements
                .iter()
                .map(|(name, value)| match parameter_by_name(name) {
                    Some(p) => format!("{} {} {}", name, value, p.units),
                    None => format!("{} {}", name, value),
                })
                .collect();
            out.push_str(": ");
            out.push_str(&values.join("; "));
        }
        out
    }
}

fn format_lat(lat: f64) -> String {
    if lat < 0.0 {
        format!("{}°S", -lat)
    } else {
        format!("{}°N", lat)
    }
}

fn format_lon(lon: f64) -> String {
    if lon < 0.0 {
        format!("{}°W", -lon)
    } else {
        format!("{}°E", lon)
    }
}

struct IndexedRecord {
    record: MeasurementRecord,
    payload: String,
    embedding: Vec<f32>,
}

/// In-process store with brute-force vector search
pub struct InMemoryStore {
    records: RwLock<Vec<IndexedRecord>>,
    refreshed_at: RwLock<Option<DateTime<Utc>>>,
    embedder: Arc<dyn Embedder>,
}

impl InMemoryStore {
    pub fn new(embedder: Arc<dyn Embedder>) -> Self {
        Self {
            records: RwLock::new(Vec::new()),
            refreshed_at: RwLock::new(None),
            embedder,
        }
    }

    pub fn with_records(records: Vec<MeasurementRecord>) -> Self {
        let store = Self::new(Arc::new(HashingEmbedder::default()));
        store.insert(records);
        store
    }

    /// Load a JSON array of records written by the ingestion pipeline
    pub fn from_json_file(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read corpus {}", path.display()))?;
        let records: Vec<MeasurementRecord> = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse corpus {}", path.display()))?;
        Ok(Self::with_records(records))
    }

    /// Index records, replacing any with the same id
    pub fn insert(&self, records: Vec<MeasurementRecord>) {
        let mut indexed = self.records.write().unwrap_or_else(PoisonError::into_inner);
        for record in records {
            let payload = record.render();
            let embedding = self.embedder.embed(&payload);
            indexed.retain(|r| r.record.id != record.id);
            indexed.push(IndexedRecord {
                record,
                payload,
                embedding,
            });
        }
        *self.refreshed_at.write().unwrap_or_else(PoisonError::into_inner) = Some(Utc::now());
    }

    pub fn len(&self) -> usize {
        self.records.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn to_hit(r: &IndexedRecord, distance: f32, similarity: f32, exactness: f32) -> StoreHit {
    StoreHit {
        source_id: r.record.id.clone(),
        kind: r.record.kind,
        distance,
        similarity,
        exactness,
        payload: r.payload.clone(),
    }
}

#[async_trait]
impl ContextStore for InMemoryStore {
    fn name(&self) -> &str {
        "in_memory"
    }

    async fn nearest(
        &self,
        center: GeoPoint,
        radius_km: f64,
        filter: &RecordFilter,
        limit: usize,
    ) -> Result<StoreHits, StoreError> {
        if radius_km <= 0.0 {
            return Err(StoreError::InvalidRequest(format!("radius {} km", radius_km)));
        }
        let records = self.records.read().unwrap_or_else(PoisonError::into_inner);
        let mut matches: Vec<(f64, &IndexedRecord)> = records
            .iter()
            .filter(|r| r.record.matches(filter))
            .map(|r| (haversine_km(center.lat, center.lon, r.record.lat, r.record.lon), r))
            .filter(|(d, _)| *d <= radius_km)
            .collect();
        matches.sort_by(|a, b| {
            a.0.total_cmp(&b.0)
                .then_with(|| a.1.record.id.cmp(&b.1.record.id))
        });

        let total_matches = matches.len();
        let hits = matches
            .into_iter()
            .take(limit)
            .map(|(d, r)| to_hit(r, d as f32, proximity_score(d, radius_km), 1.0))
            .collect();
        Ok(StoreHits { hits, total_matches })
    }

    async fn filter(&self, filter: &RecordFilter, limit: usize) -> Result<StoreHits, StoreError> {
        let records = self.records.read().unwrap_or_else(PoisonError::into_inner);
        let mut matches: Vec<&IndexedRecord> =
            records.iter().filter(|r| r.record.matches(filter)).collect();
        // Most recent first
        matches.sort_by(|a, b| {
            b.record
                .date
                .cmp(&a.record.date)
                .then_with(|| a.record.id.cmp(&b.record.id))
        });

        let total_matches = matches.len();
        let hits = matches
            .into_iter()
            .take(limit)
            .map(|r| to_hit(r, 0.0, 1.0, 1.0))
            .collect();
        Ok(StoreHits { hits, total_matches })
    }

    async fn similar(
        &self,
        text: &str,
        filter: &RecordFilter,
        k: usize,
    ) -> Result<StoreHits, StoreError> {
        let query = self.embedder.embed(text);
        let facets = filter.facet_count();
        let records = self.records.read().unwrap_or_else(PoisonError::into_inner);

        let mut scored: Vec<(f32, f32, &IndexedRecord)> = records
            .iter()
            .map(|r| {
                let sim = cosine_similarity(&query, &r.embedding).max(0.0);
                let exactness = if facets == 0 {
                    1.0
                } else {
                    r.record.facets_matched(filter) as f32 / facets as f32
                };
                (sim, exactness, r)
            })
            .filter(|(sim, exactness, _)| *sim > 0.0 && (facets == 0 || *exactness > 0.0))
            .collect();
        scored.sort_by(|a, b| {
            b.0.total_cmp(&a.0)
                .then_with(|| b.1.total_cmp(&a.1))
                .then_with(|| a.2.record.id.cmp(&b.2.record.id))
        });

        let total_matches = scored.len();
        let hits = scored
            .into_iter()
            .take(k)
            .map(|(sim, exactness, r)| to_hit(r, 1.0 - sim, sim, exactness))
            .collect();
        Ok(StoreHits { hits, total_matches })
    }

    async fn stats(&self) -> Result<StoreStats, StoreError> {
        Ok(StoreStats {
            record_count: self.len(),
            last_refresh: *self.refreshed_at.read().unwrap_or_else(PoisonError::into_inner),
            connections: 1,
            healthy: true,
        })
    }
}

struct DemoFloat {
    float_id: &'static str,
    lat: f64,
    lon: f64,
    temperature: f64,
    salinity: f64,
    /// Dissolved oxygen and chlorophyll for BGC floats
    bgc: Option<(f64, f64)>,
}

const DEMO_FLOATS: &[DemoFloat] = &[
    DemoFloat { float_id: "2902746", lat: 16.0, lon: 64.5, temperature: 27.8, salinity: 36.2, bgc: None },
    DemoFloat { float_id: "2902755", lat: 14.0, lon: 88.0, temperature: 28.6, salinity: 33.1, bgc: None },
    DemoFloat { float_id: "2902761", lat: 0.5, lon: 75.0, temperature: 28.9, salinity: 34.8, bgc: None },
    DemoFloat { float_id: "2902770", lat: -25.0, lon: 80.0, temperature: 19.5, salinity: 35.4, bgc: None },
    DemoFloat { float_id: "2902788", lat: 18.5, lon: 62.0, temperature: 27.1, salinity: 36.4, bgc: Some((182.0, 1.21)) },
    DemoFloat { float_id: "2902792", lat: 12.0, lon: 86.0, temperature: 28.3, salinity: 33.6, bgc: Some((151.0, 0.64)) },
];

/// Small deterministic corpus of surface profiles covering 2023, used when
/// no corpus file or index service is configured.
pub fn demo_corpus() -> Vec<MeasurementRecord> {
    let Some(start) = NaiveDate::from_ymd_opt(2023, 1, 10) else {
        return Vec::new();
    };
    let mut records = Vec::new();
    for float in DEMO_FLOATS {
        for cycle in 0..12u32 {
            let step = cycle as f64;
            let season = (step * std::f64::consts::PI / 6.0).sin();
            let mut measurements = BTreeMap::new();
            measurements.insert("temperature".to_string(), format!("{:.2}", float.temperature + 0.8 * season));
            measurements.insert("salinity".to_string(), format!("{:.3}", float.salinity - 0.05 * season));
            measurements.insert("pressure".to_string(), format!("{:.1}", 5.0 + (cycle % 3) as f64 * 2.5));
            if let Some((oxygen, chlorophyll)) = float.bgc {
                measurements.insert("DOXY".to_string(), format!("{:.1}", oxygen - 12.0 * season));
                measurements.insert("CHLA".to_string(), format!("{:.2}", chlorophyll + 0.3 * season.abs()));
            }
            records.push(MeasurementRecord {
                id: format!("{}_{:03}", float.float_id, cycle + 1),
                float_id: float.float_id.to_string(),
                cycle: Some(cycle + 1),
                lat: ((float.lat + 0.15 * step) * 100.0).round() / 100.0,
                lon: ((float.lon + 0.1 * step) * 100.0).round() / 100.0,
                date: start + chrono::Duration::days(30 * cycle as i64),
                region: None,
                measurements,
                kind: FragmentKind::Record,
            });
        }
    }
    records
}
