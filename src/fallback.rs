//! Fallback Router: one bounded escalation to a secondary source when the
//! primary bundle is insufficient.

use crate::error::StoreError;
use crate::scoring::{cosine_similarity, merged_score, MergeWeights};
use crate::selection::{assess, rank, select_within_budget};
use crate::session::SessionContext;
use crate::store::{ContextStore, Embedder, HashingEmbedder, RecordFilter};
use crate::types::*;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Secondary retrieval consulted when the primary corpus falls short
#[async_trait]
pub trait EscalationSource: Send + Sync {
    fn name(&self) -> &str;

    async fn search(&self, intent: &ClassifiedIntent, limit: usize) -> Result<Vec<ContextFragment>, StoreError>;
}

struct KnowledgeDocument {
    id: &'static str,
    regions: &'static [&'static str],
    parameters: &'static [&'static str],
    text: &'static str,
}

const DOCUMENTS: &[KnowledgeDocument] = &[
    KnowledgeDocument {
        id: "kb-arabian-sea-temperature",
        regions: &["Arabian Sea"],
        parameters: &["temperature"],
        text: "Arabian Sea surface temperature climatology: mean 27.2 °C, range 25.5 to 29.0 °C \
               (std 1.2). Warmer than open-ocean averages due to low freshwater input; \
               the summer monsoon drives upwelling that cools the western basin.",
    },
    KnowledgeDocument {
        id: "kb-arabian-sea-salinity",
        regions: &["Arabian Sea"],
        parameters: &["salinity"],
        text: "Arabian Sea salinity climatology: mean 36.1 PSU, range 35.5 to 36.8 PSU \
               (std 0.4). Evaporation exceeds precipitation, making it one of the saltiest \
               basins of the Indian Ocean.",
    },
    KnowledgeDocument {
        id: "kb-bay-of-bengal-temperature",
        regions: &["Bay of Bengal"],
        parameters: &["temperature"],
        text: "Bay of Bengal surface temperature climatology: mean 28.5 °C, range 26.8 to 30.2 °C \
               (std 1.4). Shallow mixed layers and monsoon heating keep the bay among the \
               warmest waters of the region.",
    },
    KnowledgeDocument {
        id: "kb-bay-of-bengal-salinity",
        regions: &["Bay of Bengal"],
        parameters: &["salinity"],
        text: "Bay of Bengal salinity climatology: mean 33.2 PSU, range 31.8 to 34.5 PSU \
               (std 0.8). River discharge from the Ganges and Brahmaputra freshens the \
               surface layer and produces strong stratification.",
    },
    KnowledgeDocument {
        id: "kb-indian-ocean-temperature",
        regions: &["Central Indian Ocean", "Equatorial Indian Ocean", "Southern Indian Ocean"],
        parameters: &["temperature"],
        text: "Indian Ocean surface temperature climatology: mean 26.8 °C, range 24.9 to 28.7 °C \
               (std 1.3), cooling steadily south of 10°S.",
    },
    KnowledgeDocument {
        id: "kb-indian-ocean-salinity",
        regions: &["Central Indian Ocean", "Equatorial Indian Ocean", "Southern Indian Ocean"],
        parameters: &["salinity"],
        text: "Indian Ocean salinity climatology: mean 35.0 PSU, range 34.0 to 36.0 PSU (std 0.6).",
    },
    KnowledgeDocument {
        id: "kb-oxygen-minimum-zone",
        regions: &["Arabian Sea", "Bay of Bengal"],
        parameters: &["DOXY"],
        text: "Dissolved oxygen (DOXY): the northern Indian Ocean hosts intense oxygen minimum \
               zones between roughly 150 and 1000 m, with values below 20 µmol/kg in the \
               Arabian Sea. Surface waters are near saturation, around 200 µmol/kg.",
    },
    KnowledgeDocument {
        id: "kb-chlorophyll",
        regions: &["Arabian Sea", "Bay of Bengal"],
        parameters: &["CHLA"],
        text: "Chlorophyll-a (CHLA) tracks phytoplankton biomass. Monsoon upwelling lifts \
               Arabian Sea surface values above 1 mg/m³, while the stratified Bay of Bengal \
               usually stays below 0.3 mg/m³ away from river plumes.",
    },
    KnowledgeDocument {
        id: "kb-bgc-sensors",
        regions: &[],
        parameters: &["DOXY", "CHLA", "BBP700", "PH_IN_SITU_TOTAL", "NITRATE"],
        text: "Biogeochemical Argo floats add sensors for dissolved oxygen (DOXY), chlorophyll-a \
               (CHLA), particle backscattering at 700 nm (BBP700), pH (PH_IN_SITU_TOTAL) and \
               nitrate (NITRATE) to the core temperature, salinity and pressure profiles.",
    },
    KnowledgeDocument {
        id: "kb-argo-program",
        regions: &[],
        parameters: &["temperature", "salinity", "pressure"],
        text: "Argo floats drift at 1000 m, descend to 2000 m every 10 days and profile \
               temperature, salinity and pressure on the way up before transmitting by satellite.",
    },
];

/// Built-in oceanographic reference notes used when the corpus has nothing
pub struct KnowledgeBase {
    embedder: HashingEmbedder,
    embeddings: Vec<Vec<f32>>,
    weights: MergeWeights,
}

impl KnowledgeBase {
    pub fn oceanographic() -> Self {
        let embedder = HashingEmbedder::default();
        let embeddings = DOCUMENTS.iter().map(|d| embedder.embed(d.text)).collect();
        Self {
            embedder,
            embeddings,
            weights: MergeWeights::default(),
        }
    }
}

#[async_trait]
impl EscalationSource for KnowledgeBase {
    fn name(&self) -> &str {
        "knowledge_base"
    }

    async fn search(&self, intent: &ClassifiedIntent, limit: usize) -> Result<Vec<ContextFragment>, StoreError> {
        let query = self.embedder.embed(&search_text(intent));
        let regions = intent.regions();
        let parameters = intent.measured_parameters();
        let facets = (!regions.is_empty()) as usize + (!parameters.is_empty()) as usize;

        let mut fragments: Vec<ContextFragment> = DOCUMENTS
            .iter()
            .zip(&self.embeddings)
            .filter_map(|(doc, embedding)| {
                let similarity = cosine_similarity(&query, embedding).max(0.0);
                let region_hit = regions.iter().any(|r| doc.regions.contains(&r.as_str()));
                let param_hit = parameters.iter().any(|p| doc.parameters.contains(&p.as_str()));
                let relevance = if facets == 0 {
                    similarity
                } else {
                    let exactness = (region_hit as usize + param_hit as usize) as f32 / facets as f32;
                    if exactness == 0.0 {
                        return None;
                    }
                    merged_score(similarity, exactness, &self.weights)
                };
                (relevance > 0.0).then(|| ContextFragment {
                    source_id: doc.id.to_string(),
                    kind: FragmentKind::Document,
                    vector_distance: 1.0 - similarity,
                    relevance,
                    payload: doc.text.split_whitespace().collect::<Vec<_>>().join(" "),
                    origin: self.name().to_string(),
                })
            })
            .collect();

        rank(&mut fragments);
        fragments.truncate(limit);
        Ok(fragments)
    }
}

/// Corpus-wide semantic search with every structured constraint relaxed
pub struct CorpusSearch {
    store: Arc<dyn ContextStore>,
}

impl CorpusSearch {
    pub fn new(store: Arc<dyn ContextStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl EscalationSource for CorpusSearch {
    fn name(&self) -> &str {
        "corpus_search"
    }

    async fn search(&self, intent: &ClassifiedIntent, limit: usize) -> Result<Vec<ContextFragment>, StoreError> {
        let hits = self
            .store
            .similar(&search_text(intent), &RecordFilter::default(), limit)
            .await?;
        Ok(hits
            .hits
            .into_iter()
            .map(|h| ContextFragment {
                source_id: h.source_id,
                kind: h.kind,
                vector_distance: h.distance,
                relevance: h.similarity,
                payload: h.payload,
                origin: self.name().to_string(),
            })
            .collect())
    }
}

fn search_text(intent: &ClassifiedIntent) -> String {
    let mut parts = vec![intent.normalized_text.clone()];
    parts.extend(intent.measured_parameters().iter().cloned());
    parts.extend(intent.regions().iter().map(|r| r.to_lowercase()));
    parts.join(" ")
}

pub struct FallbackRouter {
    source: Arc<dyn EscalationSource>,
    timeout: Duration,
    min_relevance: f32,
}

impl FallbackRouter {
    pub fn new(source: Arc<dyn EscalationSource>, timeout: Duration, min_relevance: f32) -> Self {
        Self {
            source,
            timeout,
            min_relevance,
        }
    }

    pub fn source_name(&self) -> &str {
        self.source.name()
    }

    /// Escalate an insufficient bundle to the secondary source, at most once.
    ///
    /// Returns the bundle to generate from and whether it came from the
    /// secondary source. The attempt and its outcome are recorded on the
    /// returned bundle either way.
    pub async fn resolve(
        &self,
        intent: &ClassifiedIntent,
        primary: ContextBundle,
        session: Option<&SessionContext>,
        budget: &ResourceBudget,
    ) -> (ContextBundle, bool) {
        let Some(trigger) = primary.insufficient_reason() else {
            return (primary, false);
        };

        // Follow-ups without a region of their own search where the conversation was
        let mut scoped = intent.clone();
        if scoped.regions().is_empty() && scoped.spatial().is_none() {
            if let Some(region) = session.and_then(|s| s.last_region()) {
                scoped
                    .parameters
                    .insert(keys::REGIONS.to_string(), ParamValue::List(vec![region.to_string()]));
            }
        }

        info!(
            source = self.source.name(),
            trigger = ?trigger,
            strategy = %primary.strategy,
            "Primary context insufficient, escalating"
        );

        let outcome =
            tokio::time::timeout(self.timeout, self.source.search(&scoped, budget.max_fragments * 2)).await;

        let record = |outcome| EscalationRecord {
            source: self.source.name().to_string(),
            trigger,
            outcome,
        };

        match outcome {
            Ok(Ok(fragments)) => {
                let total = fragments.len();
                let selection = select_within_budget(fragments, total, budget);
                let sufficiency = assess(&selection.fragments, self.min_relevance);
                if sufficiency == Sufficiency::Sufficient {
                    info!(fragments = selection.fragments.len(), "Escalation recovered context");
                    let bundle = ContextBundle {
                        escalation: Some(record(EscalationOutcome::Recovered {
                            fragments: selection.fragments.len(),
                        })),
                        fragments: selection.fragments,
                        total_score: selection.total_score,
                        truncated: selection.truncated,
                        sufficiency,
                        partial: primary.partial,
                        widened: primary.widened,
                        strategy: format!("{}+{}", primary.strategy, self.source.name()),
                    };
                    (bundle, true)
                } else {
                    info!("Escalation found nothing usable");
                    let mut bundle = primary;
                    bundle.escalation = Some(record(EscalationOutcome::StillInsufficient));
                    (bundle, false)
                }
            }
            Ok(Err(err)) => {
                warn!(error = %err, "Escalation failed");
                let mut bundle = primary;
                bundle.escalation = Some(record(EscalationOutcome::Failed { error: err.to_string() }));
                (bundle, false)
            }
            Err(_) => {
                warn!(timeout_ms = self.timeout.as_millis() as u64, "Escalation timed out");
                let mut bundle = primary;
                bundle.escalation = Some(record(EscalationOutcome::TimedOut));
                (bundle, false)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::QueryClassifier;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn intent(text: &str) -> ClassifiedIntent {
        QueryClassifier::default().classify(&Query::new(text, "s"))
    }

    fn router(source: Arc<dyn EscalationSource>) -> FallbackRouter {
        FallbackRouter::new(source, Duration::from_millis(200), 0.35)
    }

    struct CountingSource {
        calls: AtomicUsize,
        delay: Duration,
        fail: bool,
    }

    #[async_trait]
    impl EscalationSource for CountingSource {
        fn name(&self) -> &str {
            "counting"
        }

        async fn search(&self, _: &ClassifiedIntent, _: usize) -> Result<Vec<ContextFragment>, StoreError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            if self.fail {
                return Err(StoreError::Unavailable("search api down".into()));
            }
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn knowledge_base_matches_region_and_parameter() {
        let kb = KnowledgeBase::oceanographic();
        let frags = kb.search(&intent("salinity in the bay of bengal"), 4).await.unwrap();
        assert_eq!(frags[0].source_id, "kb-bay-of-bengal-salinity");
        assert!(frags[0].payload.contains("33.2 PSU"));
        assert!(frags.iter().all(|f| f.kind == FragmentKind::Document));
    }

    #[tokio::test]
    async fn sufficient_bundle_is_untouched() {
        let source = Arc::new(CountingSource { calls: AtomicUsize::new(0), delay: Duration::ZERO, fail: false });
        let mut primary = ContextBundle::insufficient("nearest", InsufficientReason::NoMatches);
        primary.sufficiency = Sufficiency::Sufficient;
        let (bundle, used) = router(source.clone())
            .resolve(&intent("temperature"), primary, None, &ResourceBudget::default())
            .await;
        assert!(!used);
        assert!(bundle.escalation.is_none());
        assert_eq!(source.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn insufficient_bundle_escalates_and_records() {
        let r = router(Arc::new(KnowledgeBase::oceanographic()));
        let primary = ContextBundle::insufficient("range_filter", InsufficientReason::NoMatches);
        let (bundle, used) = r
            .resolve(&intent("temperature in 1995"), primary, None, &ResourceBudget::default())
            .await;
        assert!(used);
        assert!(bundle.is_sufficient());
        assert_eq!(bundle.strategy, "range_filter+knowledge_base");
        let escalation = bundle.escalation.unwrap();
        assert_eq!(escalation.trigger, InsufficientReason::NoMatches);
        assert!(matches!(escalation.outcome, EscalationOutcome::Recovered { .. }));
    }

    #[tokio::test]
    async fn escalation_happens_exactly_once() {
        let source = Arc::new(CountingSource { calls: AtomicUsize::new(0), delay: Duration::ZERO, fail: false });
        let primary = ContextBundle::insufficient("semantic", InsufficientReason::BelowThreshold);
        let (bundle, used) = router(source.clone())
            .resolve(&intent("anything"), primary, None, &ResourceBudget::default())
            .await;
        assert!(!used);
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
        assert_eq!(bundle.escalation.unwrap().outcome, EscalationOutcome::StillInsufficient);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_escalation_times_out() {
        let source = Arc::new(CountingSource { calls: AtomicUsize::new(0), delay: Duration::from_secs(5), fail: false });
        let primary = ContextBundle::insufficient("nearest", InsufficientReason::TimedOut);
        let (bundle, used) = router(source)
            .resolve(&intent("temperature"), primary, None, &ResourceBudget::default())
            .await;
        assert!(!used);
        assert_eq!(bundle.escalation.unwrap().outcome, EscalationOutcome::TimedOut);
    }

    #[tokio::test]
    async fn failed_escalation_keeps_primary() {
        let source = Arc::new(CountingSource { calls: AtomicUsize::new(0), delay: Duration::ZERO, fail: true });
        let primary = ContextBundle::insufficient("nearest", InsufficientReason::Unavailable);
        let (bundle, used) = router(source)
            .resolve(&intent("temperature"), primary, None, &ResourceBudget::default())
            .await;
        assert!(!used);
        assert!(!bundle.is_sufficient());
        assert!(matches!(bundle.escalation.unwrap().outcome, EscalationOutcome::Failed { .. }));
    }
}
