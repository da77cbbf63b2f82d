//! Context Retriever: per-intent retrieval strategies over a `ContextStore`

use crate::error::StoreError;
use crate::scoring::{merged_score, MergeWeights};
use crate::selection::{assess, fuse_fragments, select_within_budget};
use crate::session::SessionContext;
use crate::store::{ContextStore, GeoPoint, RecordFilter, StoreHit, StoreHits};
use crate::types::*;
use crate::vocabulary::region_by_name;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    /// Candidates requested per store call
    pub top_k: usize,
    pub widen_multiplier: f64,
    /// Best fragment relevance below this makes a bundle insufficient
    pub min_relevance: f32,
    #[serde(rename = "store_timeout_ms", with = "millis")]
    pub store_timeout: Duration,
    #[serde(rename = "retry_backoff_ms", with = "millis")]
    pub retry_backoff: Duration,
    pub weights: MergeWeights,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: 20,
            widen_multiplier: 3.0,
            min_relevance: 0.35,
            store_timeout: Duration::from_secs(2),
            retry_backoff: Duration::from_millis(100),
            weights: MergeWeights::default(),
        }
    }
}

pub(crate) mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

/// Fragments gathered by one strategy before budgeting
#[derive(Debug, Default)]
struct Gathered {
    fragments: Vec<ContextFragment>,
    total_matches: usize,
    widened: bool,
    partial: bool,
}

pub struct ContextRetriever {
    store: Arc<dyn ContextStore>,
    config: RetrievalConfig,
}

impl ContextRetriever {
    pub fn new(store: Arc<dyn ContextStore>, config: RetrievalConfig) -> Self {
        Self { store, config }
    }

    pub fn store(&self) -> &Arc<dyn ContextStore> {
        &self.store
    }

    pub fn config(&self) -> &RetrievalConfig {
        &self.config
    }

    /// Build a ranked, budget-bounded bundle for `intent`.
    ///
    /// Never fails: store unavailability and timeouts come back as an
    /// insufficient bundle carrying the reason, so the fallback router can
    /// tell "no data" apart from "the store is down".
    pub async fn retrieve(
        &self,
        intent: &ClassifiedIntent,
        session: Option<&SessionContext>,
        budget: &ResourceBudget,
    ) -> ContextBundle {
        let start = Instant::now();
        let strategy = strategy_name(intent);

        let gathered = match intent.kind {
            IntentKind::Spatial => self.retrieve_spatial(intent).await,
            IntentKind::Temporal => self.retrieve_temporal(intent).await,
            IntentKind::Comparative | IntentKind::Biogeochemical => self.retrieve_fan_out(intent).await,
            IntentKind::Lookup => self.retrieve_lookup(intent).await,
            IntentKind::FreeText => self.retrieve_semantic(intent, session).await,
        };

        let gathered = match gathered {
            Ok(g) => g,
            Err(err) => {
                let reason = match err {
                    StoreError::Timeout(_) => InsufficientReason::TimedOut,
                    _ => InsufficientReason::Unavailable,
                };
                warn!(strategy, "Retrieval failed: {}", err);
                return ContextBundle::insufficient(strategy, reason);
            }
        };

        let selection = select_within_budget(gathered.fragments, gathered.total_matches, budget);
        let sufficiency = assess(&selection.fragments, self.config.min_relevance);

        info!(
            strategy,
            fragments = selection.fragments.len(),
            total_matches = gathered.total_matches,
            truncated = selection.truncated,
            widened = gathered.widened,
            partial = gathered.partial,
            sufficient = sufficiency == Sufficiency::Sufficient,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Retrieved context"
        );

        ContextBundle {
            fragments: selection.fragments,
            total_score: selection.total_score,
            truncated: selection.truncated,
            sufficiency,
            partial: gathered.partial,
            widened: gathered.widened,
            strategy: strategy.to_string(),
            escalation: None,
        }
    }

    /// One store call bounded by the store timeout, retried once after a
    /// backoff. Malformed requests are not retried.
    async fn call_store<F, Fut>(&self, op: &str, mut call: F) -> Result<StoreHits, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<StoreHits, StoreError>>,
    {
        let timeout = self.config.store_timeout;
        let mut retried = false;
        loop {
            let result = match tokio::time::timeout(timeout, call()).await {
                Ok(result) => result,
                Err(_) => Err(StoreError::Timeout(timeout.as_millis() as u64)),
            };
            match result {
                Ok(hits) => return Ok(hits),
                Err(err @ StoreError::InvalidRequest(_)) => return Err(err),
                Err(err) if !retried => {
                    warn!(op, "Store call failed, retrying once: {}", err);
                    retried = true;
                    tokio::time::sleep(self.config.retry_backoff).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn retrieve_spatial(&self, intent: &ClassifiedIntent) -> Result<Gathered, StoreError> {
        let mut filter = RecordFilter {
            date_range: intent.date_range(),
            parameters: intent.measured_parameters().to_vec(),
            ..Default::default()
        };

        let (center, radius_km) = match intent.spatial() {
            Some(sp) => (GeoPoint { lat: sp.lat, lon: sp.lon }, sp.radius_km),
            None => match intent.regions().first().and_then(|r| region_by_name(r)) {
                Some(region) => {
                    let (lat, lon) = region.centroid();
                    filter.region = Some(region.name.to_string());
                    (GeoPoint { lat, lon }, region.covering_radius_km())
                }
                // Nothing to anchor on; treat as a semantic search
                None => return self.semantic(&intent.normalized_text, &filter).await,
            },
        };

        let limit = self.config.top_k;
        let mut hits = {
            let filter = &filter;
            self.call_store("nearest", move || self.store.nearest(center, radius_km, filter, limit))
                .await?
        };
        order_by_distance(&mut hits);
        debug!(
            lat = center.lat,
            lon = center.lon,
            radius_km,
            hits = hits.hits.len(),
            "Nearest-neighbour query"
        );

        if hits.total_matches == 0 {
            if let Some(range) = filter.date_range {
                let widened = RecordFilter {
                    date_range: Some(range.widened(self.config.widen_multiplier)),
                    ..filter.clone()
                };
                info!(from = %range.start, to = %range.end, "No spatial matches, widening date range once");
                let filter = &widened;
                let mut hits = self
                    .call_store("nearest", move || self.store.nearest(center, radius_km, filter, limit))
                    .await?;
                order_by_distance(&mut hits);
                return Ok(self.gathered(hits, true));
            }
        }
        Ok(self.gathered(hits, false))
    }

    async fn retrieve_temporal(&self, intent: &ClassifiedIntent) -> Result<Gathered, StoreError> {
        let Some(range) = intent.date_range() else {
            return self.semantic(&intent.normalized_text, &RecordFilter::default()).await;
        };
        let filter = RecordFilter {
            date_range: Some(range),
            parameters: intent.measured_parameters().to_vec(),
            region: intent.regions().first().cloned(),
            ..Default::default()
        };

        let limit = self.config.top_k;
        let hits = {
            let filter = &filter;
            self.call_store("filter", move || self.store.filter(filter, limit)).await?
        };
        if hits.total_matches > 0 {
            return Ok(self.gathered(hits, false));
        }

        let widened_range = range.widened(self.config.widen_multiplier);
        info!(
            from = %range.start,
            to = %range.end,
            widened_from = %widened_range.start,
            widened_to = %widened_range.end,
            "No temporal matches, widening range once"
        );
        let widened = RecordFilter {
            date_range: Some(widened_range),
            ..filter
        };
        let filter = &widened;
        let hits = self
            .call_store("filter", move || self.store.filter(filter, limit))
            .await?;
        Ok(self.gathered(hits, true))
    }

    /// Parallel sub-retrievals, one per region or parameter, merged by
    /// weighted similarity and filter exactness.
    async fn retrieve_fan_out(&self, intent: &ClassifiedIntent) -> Result<Gathered, StoreError> {
        let regions = intent.regions();
        let parameters = intent.measured_parameters();
        let base = RecordFilter {
            date_range: intent.date_range(),
            parameters: parameters.to_vec(),
            region: regions.first().cloned(),
            float_id: intent.float_id().map(String::from),
        };

        let sub_queries: Vec<(String, RecordFilter)> = if regions.len() >= 2 {
            regions
                .iter()
                .map(|region| {
                    let text = format!("{} {}", parameters.join(" "), region);
                    (text, RecordFilter { region: Some(region.clone()), ..base.clone() })
                })
                .collect()
        } else if !parameters.is_empty() {
            parameters
                .iter()
                .map(|param| {
                    let text = format!("{} {}", param, regions.join(" "));
                    (text, RecordFilter { parameters: vec![param.clone()], ..base.clone() })
                })
                .collect()
        } else {
            vec![(intent.normalized_text.clone(), base)]
        };

        debug!(sub_queries = sub_queries.len(), "Fanning out retrieval");

        let k = self.config.top_k;
        let futures = sub_queries.iter().map(|(text, filter)| {
            self.call_store("similar", move || self.store.similar(text, filter, k))
        });
        let results = join_all(futures).await;

        let mut lists = Vec::new();
        // Matches a sub-query reported beyond the hits it returned
        let mut unreturned = 0;
        let mut failures = Vec::new();
        for result in results {
            match result {
                Ok(hits) => {
                    unreturned += hits.total_matches.saturating_sub(hits.hits.len());
                    let weights = &self.config.weights;
                    lists.push(
                        hits.hits
                            .into_iter()
                            .map(|h| {
                                let relevance = merged_score(h.similarity, h.exactness, weights);
                                fragment(h, relevance, self.store.name())
                            })
                            .collect(),
                    );
                }
                Err(err) => failures.push(err),
            }
        }

        let partial = !failures.is_empty();
        if lists.is_empty() {
            if let Some(err) = failures.into_iter().next() {
                return Err(err);
            }
        } else if partial {
            warn!(failed = failures.len(), "Some parallel retrievals failed; bundle is partial");
        }

        // Overlapping sub-queries share records; count each source once
        let fragments = fuse_fragments(lists);
        Ok(Gathered {
            total_matches: fragments.len() + unreturned,
            fragments,
            widened: false,
            partial,
        })
    }

    async fn retrieve_lookup(&self, intent: &ClassifiedIntent) -> Result<Gathered, StoreError> {
        let filter = RecordFilter {
            parameters: intent.measured_parameters().to_vec(),
            float_id: intent.float_id().map(String::from),
            ..Default::default()
        };
        if filter.float_id.is_none() {
            return self.semantic(&intent.normalized_text, &filter).await;
        }
        let limit = self.config.top_k;
        let filter = &filter;
        let hits = self
            .call_store("filter", move || self.store.filter(filter, limit))
            .await?;
        Ok(self.gathered(hits, false))
    }

    async fn retrieve_semantic(
        &self,
        intent: &ClassifiedIntent,
        session: Option<&SessionContext>,
    ) -> Result<Gathered, StoreError> {
        let mut text = intent.normalized_text.clone();
        if intent.regions().is_empty() {
            if let Some(region) = session.and_then(|s| s.last_region()) {
                debug!(region, "Carrying session region into semantic search");
                text.push(' ');
                text.push_str(&region.to_lowercase());
            }
        }
        self.semantic(&text, &RecordFilter::default()).await
    }

    async fn semantic(&self, text: &str, filter: &RecordFilter) -> Result<Gathered, StoreError> {
        let k = self.config.top_k;
        let hits = self
            .call_store("similar", move || self.store.similar(text, filter, k))
            .await?;
        let origin = self.store.name().to_string();
        let total_matches = hits.total_matches;
        let weights = &self.config.weights;
        let fragments = hits
            .hits
            .into_iter()
            .map(|h| {
                let relevance = if filter.is_empty() {
                    h.similarity
                } else {
                    merged_score(h.similarity, h.exactness, weights)
                };
                fragment(h, relevance, &origin)
            })
            .collect();
        Ok(Gathered {
            fragments,
            total_matches,
            widened: false,
            partial: false,
        })
    }

    /// Strict-filter hits all satisfy the filter, so relevance is the
    /// weighted score with full exactness.
    fn gathered(&self, hits: StoreHits, widened: bool) -> Gathered {
        let origin = self.store.name().to_string();
        let weights = &self.config.weights;
        Gathered {
            total_matches: hits.total_matches,
            fragments: hits
                .hits
                .into_iter()
                .map(|h| {
                    let relevance = merged_score(h.similarity, h.exactness, weights);
                    fragment(h, relevance, &origin)
                })
                .collect(),
            widened,
            partial: false,
        }
    }
}

/// Closest first; equal distances fall back to the source id so the order
/// does not depend on the store.
fn order_by_distance(hits: &mut StoreHits) {
    hits.hits.sort_by(|a, b| {
        a.distance
            .total_cmp(&b.distance)
            .then_with(|| a.source_id.cmp(&b.source_id))
    });
}

fn fragment(hit: StoreHit, relevance: f32, origin: &str) -> ContextFragment {
    ContextFragment {
        source_id: hit.source_id,
        kind: hit.kind,
        vector_distance: hit.distance,
        relevance,
        payload: hit.payload,
        origin: origin.to_string(),
    }
}

pub fn strategy_name(intent: &ClassifiedIntent) -> &'static str {
    match intent.kind {
        IntentKind::Spatial if intent.spatial().is_some() => "nearest",
        IntentKind::Spatial => "region",
        IntentKind::Temporal => "range_filter",
        IntentKind::Comparative | IntentKind::Biogeochemical => "fan_out",
        IntentKind::Lookup if intent.float_id().is_some() => "float_lookup",
        IntentKind::Lookup | IntentKind::FreeText => "semantic",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::QueryClassifier;
    use crate::store::{InMemoryStore, MeasurementRecord, StoreStats};
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn record(id: &str, lat: f64, lon: f64, date: &str, params: &[(&str, &str)]) -> MeasurementRecord {
        MeasurementRecord {
            id: id.to_string(),
            float_id: format!("29{}", id.len()),
            cycle: Some(1),
            lat,
            lon,
            date: date.parse().unwrap(),
            region: None,
            measurements: params.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
            kind: FragmentKind::Record,
        }
    }

    fn corpus() -> Arc<InMemoryStore> {
        Arc::new(InMemoryStore::with_records(vec![
            record("as-1", 15.6, 68.3, "2023-03-05", &[("temperature", "28.41"), ("salinity", "36.12")]),
            record("as-2", 15.9, 68.6, "2023-03-12", &[("temperature", "28.02"), ("salinity", "36.30")]),
            record("as-3", 15.5, 68.2, "2023-03-20", &[("temperature", "28.77")]),
            record("bb-1", 15.0, 88.0, "2023-03-08", &[("salinity", "33.10"), ("DOXY", "180.5")]),
            record("bb-2", 12.0, 85.0, "2023-06-14", &[("salinity", "33.42"), ("CHLA", "0.31")]),
        ]))
    }

    fn intent(text: &str) -> ClassifiedIntent {
        QueryClassifier::default().classify(&Query::new(text, "s"))
    }

    fn retriever(store: Arc<dyn ContextStore>) -> ContextRetriever {
        ContextRetriever::new(store, RetrievalConfig::default())
    }

    /// Fails the first `failures` calls, then delegates. Semantic searches
    /// whose text contains `poison` always fail.
    struct FlakyStore {
        inner: Arc<InMemoryStore>,
        failures: usize,
        calls: AtomicUsize,
        poison: Option<&'static str>,
    }

    impl FlakyStore {
        fn new(inner: Arc<InMemoryStore>, failures: usize) -> Self {
            Self { inner, failures, calls: AtomicUsize::new(0), poison: None }
        }
    }

    #[async_trait]
    impl ContextStore for FlakyStore {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn nearest(&self, c: GeoPoint, r: f64, f: &RecordFilter, l: usize) -> Result<StoreHits, StoreError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) < self.failures {
                return Err(StoreError::Unavailable("connection refused".into()));
            }
            self.inner.nearest(c, r, f, l).await
        }

        async fn filter(&self, f: &RecordFilter, l: usize) -> Result<StoreHits, StoreError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) < self.failures {
                return Err(StoreError::Unavailable("connection refused".into()));
            }
            self.inner.filter(f, l).await
        }

        async fn similar(&self, t: &str, f: &RecordFilter, k: usize) -> Result<StoreHits, StoreError> {
            let poisoned = self.poison.map_or(false, |p| t.to_lowercase().contains(p));
            if self.calls.fetch_add(1, Ordering::SeqCst) < self.failures || poisoned {
                return Err(StoreError::Unavailable("connection refused".into()));
            }
            self.inner.similar(t, f, k).await
        }

        async fn stats(&self) -> Result<StoreStats, StoreError> {
            self.inner.stats().await
        }
    }

    #[tokio::test]
    async fn spatial_fragments_sorted_by_distance() {
        let r = retriever(corpus());
        let bundle = r
            .retrieve(&intent("temperature near 15.5N 68.2E within 100km"), None, &ResourceBudget::default())
            .await;
        assert!(bundle.is_sufficient());
        let ids: Vec<_> = bundle.fragments.iter().map(|f| f.source_id.as_str()).collect();
        assert_eq!(ids, vec!["as-3", "as-1", "as-2"]);
        assert!(bundle
            .fragments
            .windows(2)
            .all(|w| w[0].vector_distance <= w[1].vector_distance));
        assert_eq!(bundle.strategy, "nearest");
    }

    #[tokio::test]
    async fn temporal_widens_once_before_giving_up() {
        let r = retriever(corpus());
        // 2023-03-25..2023-03-27 holds nothing; widened to 03-22..03-30 still nothing
        let bundle = r
            .retrieve(&intent("profiles from 2023-03-25 to 2023-03-27"), None, &ResourceBudget::default())
            .await;
        assert!(bundle.widened);
        assert_eq!(bundle.insufficient_reason(), Some(InsufficientReason::NoMatches));

        // 2023-03-14..2023-03-16 is empty but the widened range reaches as-2 (03-12)
        let bundle = r
            .retrieve(&intent("profiles from 2023-03-14 to 2023-03-16"), None, &ResourceBudget::default())
            .await;
        assert!(bundle.widened);
        assert!(bundle.is_sufficient());
        assert_eq!(bundle.fragments[0].source_id, "as-2");
    }

    #[tokio::test]
    async fn temporal_hit_is_not_widened() {
        let r = retriever(corpus());
        let bundle = r
            .retrieve(&intent("profiles in march 2023"), None, &ResourceBudget::default())
            .await;
        assert!(!bundle.widened);
        assert_eq!(bundle.fragments.len(), 4);
        assert!(bundle.fragments.iter().all(|f| f.relevance == 1.0));
    }

    #[tokio::test]
    async fn comparative_fans_out_per_region() {
        let r = retriever(corpus());
        let bundle = r
            .retrieve(
                &intent("compare salinity in arabian sea and bay of bengal"),
                None,
                &ResourceBudget::default(),
            )
            .await;
        assert_eq!(bundle.strategy, "fan_out");
        assert!(bundle.is_sufficient());
        let ids: Vec<_> = bundle.fragments.iter().map(|f| f.source_id.as_str()).collect();
        assert!(ids.iter().any(|id| id.starts_with("as-")));
        assert!(ids.iter().any(|id| id.starts_with("bb-")));
        assert!(bundle.fragments.windows(2).all(|w| w[0].relevance >= w[1].relevance));
        // no duplicates after fusion
        let mut unique = ids.clone();
        unique.sort();
        unique.dedup();
        assert_eq!(unique.len(), ids.len());
    }

    #[tokio::test]
    async fn budget_truncates_and_flags() {
        let r = retriever(corpus());
        let budget = ResourceBudget { max_fragments: 2, max_bytes: 8_000 };
        let bundle = r
            .retrieve(&intent("profiles in march 2023"), None, &budget)
            .await;
        assert_eq!(bundle.fragments.len(), 2);
        assert!(bundle.truncated);
    }

    #[tokio::test]
    async fn store_outage_is_retried_once() {
        let flaky = Arc::new(FlakyStore::new(corpus(), 1));
        let bundle = retriever(flaky.clone())
            .retrieve(&intent("temperature near 15.5N 68.2E within 100km"), None, &ResourceBudget::default())
            .await;
        assert!(bundle.is_sufficient());
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 2);

        let down = Arc::new(FlakyStore::new(corpus(), 10));
        let bundle = retriever(down.clone())
            .retrieve(&intent("temperature near 15.5N 68.2E within 100km"), None, &ResourceBudget::default())
            .await;
        assert_eq!(bundle.insufficient_reason(), Some(InsufficientReason::Unavailable));
        assert_eq!(down.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn partial_fan_out_is_marked() {
        // the Bay of Bengal sub-query fails on both attempts
        let flaky = Arc::new(FlakyStore { poison: Some("bengal"), ..FlakyStore::new(corpus(), 0) });
        let config = RetrievalConfig { retry_backoff: Duration::from_millis(1), ..Default::default() };
        let r = ContextRetriever::new(flaky, config);
        let bundle = r
            .retrieve(&intent("compare salinity in arabian sea and bay of bengal"), None, &ResourceBudget::default())
            .await;
        assert!(bundle.partial);
        assert!(!bundle.fragments.is_empty());
        assert!(bundle.fragments.iter().all(|f| f.origin == "flaky"));
    }

    #[tokio::test]
    async fn float_lookup_filters_by_id() {
        let store = Arc::new(InMemoryStore::with_records(vec![
            MeasurementRecord { float_id: "2902746".into(), ..record("f-1", 10.0, 70.0, "2023-01-01", &[("temperature", "27.9")]) },
            record("f-2", 10.0, 70.0, "2023-01-01", &[("temperature", "27.9")]),
        ]));
        let bundle = retriever(store)
            .retrieve(&intent("show float 2902746"), None, &ResourceBudget::default())
            .await;
        assert_eq!(bundle.strategy, "float_lookup");
        assert_eq!(bundle.fragments.len(), 1);
        assert_eq!(bundle.fragments[0].source_id, "f-1");
    }

    #[tokio::test]
    async fn overlapping_fan_out_counts_each_record_once() {
        let r = retriever(corpus());
        let question = intent("compare salinity in arabian sea and bay of bengal");

        let bundle = r.retrieve(&question, None, &ResourceBudget::default()).await;
        assert!(bundle.fragments.len() < ResourceBudget::default().max_fragments);
        assert!(!bundle.truncated);

        let tight = ResourceBudget { max_fragments: 2, max_bytes: 8_000 };
        assert!(r.retrieve(&question, None, &tight).await.truncated);
    }

    /// Returns every hit at the same distance, in a fixed scrambled order
    struct TiedStore;

    #[async_trait]
    impl ContextStore for TiedStore {
        fn name(&self) -> &str {
            "tied"
        }

        async fn nearest(&self, _: GeoPoint, _: f64, _: &RecordFilter, _: usize) -> Result<StoreHits, StoreError> {
            let hits = ["c", "a", "b"]
                .iter()
                .map(|id| StoreHit {
                    source_id: id.to_string(),
                    kind: FragmentKind::Record,
                    distance: 12.5,
                    similarity: 0.9,
                    exactness: 1.0,
                    payload: format!("record {id}"),
                })
                .collect();
            Ok(StoreHits { hits, total_matches: 3 })
        }

        async fn filter(&self, _: &RecordFilter, _: usize) -> Result<StoreHits, StoreError> {
            Ok(StoreHits::default())
        }

        async fn similar(&self, _: &str, _: &RecordFilter, _: usize) -> Result<StoreHits, StoreError> {
            Ok(StoreHits::default())
        }

        async fn stats(&self) -> Result<StoreStats, StoreError> {
            Err(StoreError::Unavailable("no stats".into()))
        }
    }

    #[tokio::test]
    async fn equal_distances_break_ties_by_source_id() {
        let bundle = retriever(Arc::new(TiedStore))
            .retrieve(&intent("temperature near 15.5N 68.2E within 100km"), None, &ResourceBudget::default())
            .await;
        let ids: Vec<_> = bundle.fragments.iter().map(|f| f.source_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    /// Answers only after an hour
    struct StalledStore;

    #[async_trait]
    impl ContextStore for StalledStore {
        fn name(&self) -> &str {
            "stalled"
        }

        async fn nearest(&self, _: GeoPoint, _: f64, _: &RecordFilter, _: usize) -> Result<StoreHits, StoreError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(StoreHits::default())
        }

        async fn filter(&self, _: &RecordFilter, _: usize) -> Result<StoreHits, StoreError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(StoreHits::default())
        }

        async fn similar(&self, _: &str, _: &RecordFilter, _: usize) -> Result<StoreHits, StoreError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(StoreHits::default())
        }

        async fn stats(&self) -> Result<StoreStats, StoreError> {
            Err(StoreError::Unavailable("no stats".into()))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn slow_store_times_out_as_insufficient() {
        let start = tokio::time::Instant::now();
        let bundle = retriever(Arc::new(StalledStore))
            .retrieve(&intent("salinity from 2023-03-01 to 2023-03-31"), None, &ResourceBudget::default())
            .await;
        assert_eq!(bundle.insufficient_reason(), Some(InsufficientReason::TimedOut));
        // two attempts at the store timeout plus one backoff
        let config = RetrievalConfig::default();
        assert!(start.elapsed() >= config.store_timeout * 2 + config.retry_backoff);
        assert!(start.elapsed() < Duration::from_secs(60));
    }

    #[test]
    fn widening_keeps_midpoint() {
        let d = |s: &str| s.parse::<NaiveDate>().unwrap();
        let range = DateRange::new(d("2023-03-14"), d("2023-03-16"));
        let widened = range.widened(3.0);
        assert!(widened.start <= d("2023-03-12"));
        assert!(widened.end >= d("2023-03-18"));
    }
}
