//! Query pipeline: classify, check the cache, retrieve, escalate, generate,
//! write through, remember.

use crate::cache::{CacheStats, CachedResponse, Fingerprint, Lease, Lookup, ResponseCache, WaitOutcome};
use crate::classifier::QueryClassifier;
use crate::config::{Config, FallbackSourceKind};
use crate::error::QueryError;
use crate::fallback::{CorpusSearch, EscalationSource, FallbackRouter, KnowledgeBase};
use crate::generator::{
    CancelHandle, ExtractiveModel, GenerationRequest, HttpChatModel, LanguageModel, ModelChain,
    ResponseGenerator, StreamEnd, StreamingAnswer,
};
use crate::retriever::ContextRetriever;
use crate::session::{SessionContext, SessionStore};
use crate::store::ContextStore;
use crate::types::*;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// How many times a caller re-enters the cache after a leaseholder gave up
const MAX_LEASE_RETRIES: usize = 3;

/// Result of one submitted query
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub answer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream_handle: Option<String>,
    pub intent_kind: IntentKind,
    pub used_fallback: bool,
    pub truncated: bool,
    pub status: ResponseStatus,
    pub cached: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub caveat: Option<String>,
}

impl QueryResponse {
    fn from_cached(answer: &CachedResponse, cached: bool) -> Self {
        Self {
            answer: Some(answer.answer.clone()),
            stream_handle: None,
            intent_kind: answer.intent_kind,
            used_fallback: answer.used_fallback,
            truncated: answer.truncated,
            status: answer.status,
            cached,
            caveat: answer.caveat.clone(),
        }
    }

    fn no_data(intent_kind: IntentKind, reason: &str) -> Self {
        Self {
            answer: Some(format!("No matching data found: {}.", reason)),
            stream_handle: None,
            intent_kind,
            used_fallback: false,
            truncated: false,
            status: ResponseStatus::NoData,
            cached: false,
            caveat: None,
        }
    }
}

fn describe_insufficiency(bundle: &ContextBundle) -> String {
    match bundle.insufficient_reason() {
        Some(InsufficientReason::NoMatches) | None => "no records match this question".to_string(),
        Some(InsufficientReason::BelowThreshold) => "no records are relevant enough to this question".to_string(),
        Some(InsufficientReason::Unavailable) => "the measurement store is unavailable".to_string(),
        Some(InsufficientReason::TimedOut) => "the measurement store did not respond in time".to_string(),
    }
}

struct RegisteredStream {
    stream: Option<StreamingAnswer>,
    cancel: CancelHandle,
    status: watch::Receiver<StreamStatus>,
    registered_at: Instant,
}

/// Streams waiting to be consumed, keyed by handle
pub struct StreamRegistry {
    streams: Mutex<HashMap<String, RegisteredStream>>,
    claim_timeout: Duration,
}

impl StreamRegistry {
    pub fn new(claim_timeout: Duration) -> Self {
        Self {
            streams: Mutex::new(HashMap::new()),
            claim_timeout,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, RegisteredStream>> {
        self.streams.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn register(&self, stream: StreamingAnswer) -> String {
        let handle = stream.answer_id.clone();
        let entry = RegisteredStream {
            cancel: stream.cancel_handle(),
            status: stream.status_watch(),
            stream: Some(stream),
            registered_at: Instant::now(),
        };
        self.lock().insert(handle.clone(), entry);
        handle
    }

    /// Hand the stream to its consumer. A stream can be taken once; the
    /// handle stays valid for cancellation.
    pub fn take(&self, handle: &str) -> Result<StreamingAnswer, QueryError> {
        self.lock()
            .get_mut(handle)
            .and_then(|entry| entry.stream.take())
            .ok_or_else(|| QueryError::UnknownStream(handle.to_string()))
    }

    /// Best-effort and idempotent
    pub fn cancel(&self, handle: &str) -> Result<StreamStatus, QueryError> {
        let streams = self.lock();
        let entry = streams
            .get(handle)
            .ok_or_else(|| QueryError::UnknownStream(handle.to_string()))?;
        let status = *entry.status.borrow();
        if status == StreamStatus::InProgress {
            info!(handle = %handle, "Cancelling stream");
            entry.cancel.cancel();
        }
        Ok(status)
    }

    pub fn status(&self, handle: &str) -> Option<StreamStatus> {
        self.lock().get(handle).map(|entry| *entry.status.borrow())
    }

    /// Forget finished streams and cancel ones nobody claimed in time
    pub fn purge(&self) -> usize {
        let now = Instant::now();
        let claim_timeout = self.claim_timeout;
        let mut streams = self.lock();
        let before = streams.len();
        streams.retain(|handle, entry| {
            if *entry.status.borrow() != StreamStatus::InProgress {
                return false;
            }
            let unclaimed = entry.stream.is_some();
            if unclaimed && now.duration_since(entry.registered_at) >= claim_timeout {
                warn!(handle = %handle, "Stream never claimed, cancelling");
                entry.cancel.cancel();
                return false;
            }
            true
        });
        before - streams.len()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Process-wide health, read-only
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub store: String,
    pub store_healthy: bool,
    pub corpus_size: usize,
    pub last_refresh: Option<DateTime<Utc>>,
    pub store_connections: usize,
    pub cache: CacheStats,
    pub sessions: usize,
    pub active_streams: usize,
    pub model: String,
    pub fallback_source: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PurgeReport {
    pub cache_entries: usize,
    pub sessions: usize,
    pub streams: usize,
}

pub struct QueryEngine {
    classifier: QueryClassifier,
    retriever: ContextRetriever,
    fallback: FallbackRouter,
    generator: ResponseGenerator,
    cache: ResponseCache,
    sessions: Arc<SessionStore>,
    streams: StreamRegistry,
    budget: ResourceBudget,
}

pub type SharedQueryEngine = Arc<QueryEngine>;

impl QueryEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        classifier: QueryClassifier,
        retriever: ContextRetriever,
        fallback: FallbackRouter,
        generator: ResponseGenerator,
        cache: ResponseCache,
        sessions: SessionStore,
        streams: StreamRegistry,
        budget: ResourceBudget,
    ) -> SharedQueryEngine {
        Arc::new(Self {
            classifier,
            retriever,
            fallback,
            generator,
            cache,
            sessions: Arc::new(sessions),
            streams,
            budget,
        })
    }

    /// Wire the pipeline from configuration: hosted models first, then the
    /// extractive model.
    pub fn from_config(config: &Config, store: Arc<dyn ContextStore>) -> SharedQueryEngine {
        let mut chain = ModelChain::new();
        for model in &config.generation.models {
            chain = chain.add(
                Arc::new(HttpChatModel::new(
                    model.api_url.clone(),
                    model.api_key.clone(),
                    model.model.clone(),
                )),
                Duration::from_millis(model.timeout_ms),
            );
        }
        let chain = chain.add(Arc::new(ExtractiveModel), config.generation_timeout());
        info!(models = ?chain.names(), "Model chain ready");
        Self::from_config_with_model(config, store, Arc::new(chain))
    }

    pub fn from_config_with_model(
        config: &Config,
        store: Arc<dyn ContextStore>,
        model: Arc<dyn LanguageModel>,
    ) -> SharedQueryEngine {
        let source: Arc<dyn EscalationSource> = match config.fallback.source {
            FallbackSourceKind::KnowledgeBase => Arc::new(KnowledgeBase::oceanographic()),
            FallbackSourceKind::Corpus => Arc::new(CorpusSearch::new(store.clone())),
        };
        Self::new(
            QueryClassifier::new(config.classifier.default_radius_km),
            ContextRetriever::new(store, config.retrieval.clone()),
            FallbackRouter::new(source, config.escalation_timeout(), config.retrieval.min_relevance),
            ResponseGenerator::new(model, config.segment_timeout(), config.generation_timeout()),
            ResponseCache::new(config.cache.clone()),
            SessionStore::new(config.session.max_turns, config.session_idle_timeout()),
            StreamRegistry::new(config.stream_claim_timeout()),
            config.budget,
        )
    }

    pub fn cache(&self) -> &ResponseCache {
        &self.cache
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    pub fn streams(&self) -> &StreamRegistry {
        &self.streams
    }

    /// Run a query through the pipeline
    pub async fn submit(&self, query: Query, mode: GenerationMode) -> Result<QueryResponse, QueryError> {
        let start = Instant::now();
        info!(
            session_id = %query.session_id,
            mode = ?mode,
            "Received query: '{}'",
            query.raw_text
        );

        match &query.filters {
            Some(filters) => filters.validate()?,
            None if query.raw_text.trim().is_empty() => {
                return Err(QueryError::InvalidFilter("query text is empty".to_string()));
            }
            None => {}
        }

        // Step 1: Classify against the conversation so far
        let session = self.sessions.snapshot(&query.session_id);
        let intent = self.classifier.classify_in_session(&query, session.as_ref());
        info!(
            kind = ?intent.kind,
            confidence = intent.confidence,
            parameters = intent.parameters.len(),
            "Classified query"
        );

        // Step 2: Record the turn at submission
        let turn_id = self.sessions.begin_turn(&query.session_id, &query, &intent);

        // Step 3: Claim or join
        let fingerprint = Fingerprint::compute(
            &query,
            &intent,
            query.submitted_at,
            self.cache.policy().time_bucket,
        );
        let ttl = self.cache.policy().ttl_for(&intent);

        let mut retries = 0;
        let lease = loop {
            match self.cache.get_or_begin(&fingerprint, ttl) {
                Lookup::Ready(answer) => {
                    info!(fingerprint = %fingerprint, "Served from cache");
                    self.sessions.record_summary(&query.session_id, turn_id, &answer.answer);
                    return Ok(QueryResponse::from_cached(&answer, true));
                }
                Lookup::Wait(handle) => {
                    debug!(fingerprint = %fingerprint, "Waiting on in-flight generation");
                    match handle.wait().await {
                        WaitOutcome::Ready(answer) => {
                            self.sessions.record_summary(&query.session_id, turn_id, &answer.answer);
                            return Ok(QueryResponse::from_cached(&answer, true));
                        }
                        WaitOutcome::Failed(QueryError::InsufficientContext(reason)) => {
                            return Ok(QueryResponse::no_data(intent.kind, &reason));
                        }
                        WaitOutcome::Failed(err) => return Err(err),
                        WaitOutcome::Retry => {
                            retries += 1;
                            if retries > MAX_LEASE_RETRIES {
                                warn!(fingerprint = %fingerprint, "Gave up waiting for a lease");
                                return Err(QueryError::LeaseExpired);
                            }
                            debug!(fingerprint = %fingerprint, retries, "Leaseholder gave up, retrying");
                        }
                    }
                }
                Lookup::Begin(lease) => break lease,
            }
        };

        // Step 4: Retrieve, escalating once if needed
        let primary = self.retriever.retrieve(&intent, session.as_ref(), &self.budget).await;
        let (bundle, used_fallback) = self
            .fallback
            .resolve(&intent, primary, session.as_ref(), &self.budget)
            .await;

        if !bundle.is_sufficient() {
            let reason = describe_insufficiency(&bundle);
            // An outage is a retryable failure, not an empty result
            if matches!(
                bundle.insufficient_reason(),
                Some(InsufficientReason::Unavailable | InsufficientReason::TimedOut)
            ) {
                warn!(
                    strategy = %bundle.strategy,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "Store unreachable and escalation recovered nothing"
                );
                let err = QueryError::RetrievalUnavailable(reason);
                self.cache.fail(lease, err.clone());
                self.sessions.record_summary(&query.session_id, turn_id, "failed: store unavailable");
                return Err(err);
            }
            info!(
                strategy = %bundle.strategy,
                elapsed_ms = start.elapsed().as_millis() as u64,
                "No data for query: {}",
                reason
            );
            self.cache.fail(lease, QueryError::InsufficientContext(reason.clone()));
            self.sessions.record_summary(&query.session_id, turn_id, "no data");
            return Ok(QueryResponse::no_data(intent.kind, &reason));
        }

        // Step 5: Generate
        let request = GenerationRequest::build(&query.raw_text, &intent, &bundle, session.as_ref());
        let status = if request.caveat.is_some() {
            ResponseStatus::AnsweredWithCaveat
        } else {
            ResponseStatus::Answered
        };
        let template = CachedResponse {
            answer: String::new(),
            intent_kind: intent.kind,
            used_fallback,
            truncated: bundle.truncated,
            status,
            caveat: request.caveat.clone(),
        };

        match mode {
            GenerationMode::Batch => match self.generator.generate_batch(&request).await {
                Ok(answer) => {
                    info!(
                        model = %answer.model,
                        fragments = bundle.fragments.len(),
                        elapsed_ms = start.elapsed().as_millis() as u64,
                        "Answer generated"
                    );
                    self.sessions.record_summary(&query.session_id, turn_id, &answer.text);
                    let stored = self.cache.complete(
                        lease,
                        CachedResponse {
                            answer: answer.text,
                            ..template
                        },
                    );
                    Ok(QueryResponse::from_cached(&stored, false))
                }
                Err(e) => {
                    warn!(error = %e, "Generation failed");
                    self.cache.fail(lease, e.clone());
                    Err(e)
                }
            },
            GenerationMode::Stream => match self.generator.generate_stream(&request).await {
                Ok((stream, end)) => {
                    let handle = self.streams.register(stream);
                    info!(handle = %handle, fragments = bundle.fragments.len(), "Streaming answer");
                    tokio::spawn(settle_stream(
                        self.cache.clone(),
                        self.sessions.clone(),
                        lease,
                        end,
                        template.clone(),
                        query.session_id.clone(),
                        turn_id,
                    ));
                    Ok(QueryResponse {
                        answer: None,
                        stream_handle: Some(handle),
                        intent_kind: template.intent_kind,
                        used_fallback,
                        truncated: template.truncated,
                        status: ResponseStatus::Streaming,
                        cached: false,
                        caveat: template.caveat,
                    })
                }
                Err(e) => {
                    warn!(error = %e, "Could not start stream");
                    self.cache.fail(lease, e.clone());
                    Err(e)
                }
            },
        }
    }

    pub fn take_stream(&self, handle: &str) -> Result<StreamingAnswer, QueryError> {
        self.streams.take(handle)
    }

    pub fn cancel_stream(&self, handle: &str) -> Result<StreamStatus, QueryError> {
        self.streams.cancel(handle)
    }

    pub fn session(&self, session_id: &str) -> Option<SessionContext> {
        self.sessions.snapshot(session_id)
    }

    pub async fn status(&self) -> StatusReport {
        let store = self.retriever.store();
        let stats = tokio::time::timeout(self.retriever.config().store_timeout, store.stats()).await;
        let (healthy, corpus_size, last_refresh, connections) = match stats {
            Ok(Ok(s)) => (s.healthy, s.record_count, s.last_refresh, s.connections),
            Ok(Err(e)) => {
                warn!(error = %e, "Store stats unavailable");
                (false, 0, None, 0)
            }
            Err(_) => {
                warn!("Store stats timed out");
                (false, 0, None, 0)
            }
        };
        StatusReport {
            store: store.name().to_string(),
            store_healthy: healthy,
            corpus_size,
            last_refresh,
            store_connections: connections,
            cache: self.cache.stats(),
            sessions: self.sessions.len(),
            active_streams: self.streams.len(),
            model: self.generator.model_name().to_string(),
            fallback_source: self.fallback.source_name().to_string(),
        }
    }

    /// Periodic housekeeping: expired answers, idle sessions, dead streams
    pub fn purge(&self) -> PurgeReport {
        let report = PurgeReport {
            cache_entries: self.cache.purge_expired(),
            sessions: self.sessions.evict_idle(),
            streams: self.streams.purge(),
        };
        if report != PurgeReport::default() {
            info!(
                cache_entries = report.cache_entries,
                sessions = report.sessions,
                streams = report.streams,
                "Maintenance purge"
            );
        }
        report
    }
}

/// Settle the lease once the stream ends. Only a complete stream is cached.
async fn settle_stream(
    cache: ResponseCache,
    sessions: Arc<SessionStore>,
    lease: Lease,
    end: oneshot::Receiver<StreamEnd>,
    template: CachedResponse,
    session_id: String,
    turn_id: u64,
) {
    match end.await {
        Ok(StreamEnd {
            status: StreamStatus::Complete,
            text,
            ..
        }) => {
            sessions.record_summary(&session_id, turn_id, &text);
            cache.complete(lease, CachedResponse { answer: text, ..template });
        }
        Ok(StreamEnd {
            status: StreamStatus::Cancelled,
            segments,
            ..
        }) => {
            info!(fingerprint = %lease.fingerprint(), segments, "Stream cancelled, nothing cached");
            cache.fail(lease, QueryError::CancellationRequested);
        }
        Ok(StreamEnd { error, .. }) => {
            let err = error.unwrap_or_else(|| QueryError::GenerationFailed("stream ended with an error".to_string()));
            warn!(error = %err, "Stream failed");
            cache.fail(lease, err);
        }
        Err(_) => {
            cache.fail(lease, QueryError::GenerationFailed("stream task ended unexpectedly".to_string()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generator::ScriptedModel;

    #[tokio::test]
    async fn registry_take_is_single_use_and_cancel_is_idempotent() {
        let generator = ResponseGenerator::new(
            Arc::new(ScriptedModel::new(["a", "b"]).with_pacing(Duration::from_millis(20))),
            Duration::from_secs(1),
            Duration::from_secs(1),
        );
        let bundle = ContextBundle::insufficient("nearest", InsufficientReason::NoMatches);
        let intent = ClassifiedIntent::free_text("a", 0.3);
        let request = GenerationRequest::build("a", &intent, &bundle, None);
        let (stream, _end) = generator.generate_stream(&request).await.unwrap();

        let registry = StreamRegistry::new(Duration::from_secs(60));
        let handle = registry.register(stream);
        assert!(registry.take(&handle).is_ok());
        assert!(matches!(registry.take(&handle), Err(QueryError::UnknownStream(_))));

        assert!(registry.cancel(&handle).is_ok());
        assert!(registry.cancel(&handle).is_ok());
        assert!(matches!(registry.cancel("nope"), Err(QueryError::UnknownStream(_))));
    }

    #[tokio::test]
    async fn registry_purges_unclaimed_streams() {
        let generator = ResponseGenerator::new(
            Arc::new(ScriptedModel::new(["a", "b", "c"])),
            Duration::from_secs(1),
            Duration::from_secs(1),
        );
        let bundle = ContextBundle::insufficient("nearest", InsufficientReason::NoMatches);
        let intent = ClassifiedIntent::free_text("a", 0.3);
        let request = GenerationRequest::build("a", &intent, &bundle, None);
        let (stream, end) = generator.generate_stream(&request).await.unwrap();

        let registry = StreamRegistry::new(Duration::ZERO);
        registry.register(stream);
        assert_eq!(registry.purge(), 1);
        assert!(registry.is_empty());
        assert_eq!(end.await.unwrap().status, StreamStatus::Cancelled);
    }

    #[test]
    fn no_data_is_distinct_from_an_answer() {
        let response = QueryResponse::no_data(IntentKind::Temporal, "no records match this question");
        assert_eq!(response.status, ResponseStatus::NoData);
        assert!(!response.used_fallback);
        assert!(response.answer.unwrap().starts_with("No matching data found"));
    }
}
