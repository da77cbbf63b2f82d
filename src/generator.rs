//! Response Generator: prompt building, streaming with cancellation, batch mode.
//!
//! Models implement [`LanguageModel`]. Streaming goes through a forwarder task
//! that sits between the model's chunk channel and the consumer: it checks for
//! cancellation before every segment, bounds each segment with a timeout, and
//! reports how the stream ended on a oneshot so the pipeline can settle its
//! cache lease.

use crate::error::QueryError;
use crate::session::SessionContext;
use crate::types::*;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

const SYSTEM_PROMPT: &str = "You are an oceanographic data assistant answering questions about \
Argo float measurements in the Indian Ocean. Answer only from the numbered context below. \
Reproduce every numeric value exactly as written in the context, with its unit; never round \
or convert. If the context does not answer the question, say so.";

/// Turns of conversation included in the prompt
const HISTORY_TURNS: usize = 5;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Prompt {
    pub system: String,
    pub user: String,
}

/// Everything a model needs for one answer
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub prompt: Prompt,
    pub question: String,
    pub intent_kind: IntentKind,
    /// Verbatim fragments, for models that answer extractively
    pub fragments: Vec<ContextFragment>,
    pub caveat: Option<String>,
}

impl GenerationRequest {
    pub fn build(
        question: &str,
        intent: &ClassifiedIntent,
        bundle: &ContextBundle,
        session: Option<&SessionContext>,
    ) -> Self {
        let caveat = caveat_for(bundle);
        Self {
            prompt: build_prompt(question, intent, bundle, session, caveat.as_deref()),
            question: question.to_string(),
            intent_kind: intent.kind,
            fragments: bundle.fragments.clone(),
            caveat,
        }
    }
}

/// Disclosure owed to the reader when the context is second-hand or incomplete
pub fn caveat_for(bundle: &ContextBundle) -> Option<String> {
    if let Some(escalation) = &bundle.escalation {
        if matches!(escalation.outcome, EscalationOutcome::Recovered { .. }) {
            return Some(format!(
                "No sufficient float measurements matched; this answer uses the {} instead.",
                escalation.source.replace('_', " ")
            ));
        }
    }
    if bundle.partial {
        return Some("Some data sources did not respond; results may be incomplete.".to_string());
    }
    if bundle.widened {
        return Some("No data in the requested period; the date range was widened.".to_string());
    }
    None
}

pub fn build_prompt(
    question: &str,
    intent: &ClassifiedIntent,
    bundle: &ContextBundle,
    session: Option<&SessionContext>,
    caveat: Option<&str>,
) -> Prompt {
    let mut user = String::new();

    if let Some(session) = session {
        let history = session.history(HISTORY_TURNS);
        if !history.is_empty() {
            user.push_str("Conversation so far:\n");
            for line in history {
                user.push_str(&line);
                user.push('\n');
            }
            user.push('\n');
        }
    }

    user.push_str(&format!("Query type: {}\n", intent.kind.as_str()));
    user.push_str("Context:\n");
    for (i, frag) in bundle.fragments.iter().enumerate() {
        user.push_str(&format!("[{}] ({}) {}\n", i + 1, frag.origin, frag.payload));
    }
    if bundle.truncated {
        user.push_str("(More matching records exist than are shown.)\n");
    }
    if let Some(caveat) = caveat {
        user.push_str(&format!("\nNote: {}\n", caveat));
    }
    user.push_str(&format!("\nQuestion: {}\n", question));

    Prompt {
        system: SYSTEM_PROMPT.to_string(),
        user,
    }
}

pub type ChunkReceiver = mpsc::Receiver<Result<String, QueryError>>;

/// Text generation capability
#[async_trait]
pub trait LanguageModel: Send + Sync {
    fn name(&self) -> &str;

    async fn complete(&self, request: &GenerationRequest) -> Result<String, QueryError>;

    /// Incremental generation. The default produces the whole completion as
    /// a single chunk. Implementations must stop producing once the receiver
    /// is dropped.
    async fn stream(&self, request: &GenerationRequest) -> Result<ChunkReceiver, QueryError> {
        let text = self.complete(request).await?;
        let (tx, rx) = mpsc::channel(1);
        tokio::spawn(async move {
            let _ = tx.send(Ok(text)).await;
        });
        Ok(rx)
    }
}

/// Deterministic local model that quotes fragment payloads verbatim, one
/// segment per fragment. Always available.
pub struct ExtractiveModel;

impl ExtractiveModel {
    fn segments(request: &GenerationRequest) -> Vec<String> {
        let mut segments = Vec::with_capacity(request.fragments.len() + 2);
        if request.fragments.is_empty() {
            segments.push("No matching measurements were found for this question.".to_string());
            return segments;
        }
        segments.push(format!(
            "Found {} relevant {}:\n",
            request.fragments.len(),
            if request.fragments.len() == 1 { "entry" } else { "entries" }
        ));
        for frag in &request.fragments {
            segments.push(format!("- {}\n", frag.payload));
        }
        if let Some(caveat) = &request.caveat {
            segments.push(format!("\nNote: {}", caveat));
        }
        segments
    }
}

#[async_trait]
impl LanguageModel for ExtractiveModel {
    fn name(&self) -> &str {
        "extractive"
    }

    async fn complete(&self, request: &GenerationRequest) -> Result<String, QueryError> {
        Ok(Self::segments(request).concat())
    }

    async fn stream(&self, request: &GenerationRequest) -> Result<ChunkReceiver, QueryError> {
        let segments = Self::segments(request);
        let (tx, rx) = mpsc::channel(1);
        tokio::spawn(async move {
            for segment in segments {
                if tx.send(Ok(segment)).await.is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }
}

/// Scripted model for tests and demos: emits fixed segments with optional pacing
pub struct ScriptedModel {
    segments: Vec<String>,
    pacing: Duration,
    fail_after: Option<usize>,
    produced: Arc<AtomicUsize>,
    calls: AtomicUsize,
}

impl ScriptedModel {
    pub fn new<S: Into<String>>(segments: impl IntoIterator<Item = S>) -> Self {
        Self {
            segments: segments.into_iter().map(Into::into).collect(),
            pacing: Duration::ZERO,
            fail_after: None,
            produced: Arc::new(AtomicUsize::new(0)),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_pacing(mut self, pacing: Duration) -> Self {
        self.pacing = pacing;
        self
    }

    /// Fail with `GenerationFailed` after emitting `n` segments
    pub fn failing_after(mut self, n: usize) -> Self {
        self.fail_after = Some(n);
        self
    }

    /// Segments handed to the channel so far, across all calls
    pub fn produced(&self) -> usize {
        self.produced.load(Ordering::SeqCst)
    }

    /// Number of generations started
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, _request: &GenerationRequest) -> Result<String, QueryError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.pacing * self.segments.len() as u32).await;
        match self.fail_after {
            Some(_) => Err(QueryError::GenerationFailed("scripted failure".to_string())),
            None => Ok(self.segments.concat()),
        }
    }

    async fn stream(&self, _request: &GenerationRequest) -> Result<ChunkReceiver, QueryError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let segments = self.segments.clone();
        let pacing = self.pacing;
        let fail_after = self.fail_after;
        let produced = self.produced.clone();
        let (tx, rx) = mpsc::channel(1);
        tokio::spawn(async move {
            for (i, segment) in segments.into_iter().enumerate() {
                if fail_after == Some(i) {
                    let _ = tx
                        .send(Err(QueryError::GenerationFailed("scripted failure".to_string())))
                        .await;
                    return;
                }
                if !pacing.is_zero() {
                    tokio::time::sleep(pacing).await;
                }
                if tx.send(Ok(segment)).await.is_err() {
                    return;
                }
                produced.fetch_add(1, Ordering::SeqCst);
            }
        });
        Ok(rx)
    }
}

/// OpenAI-compatible chat completions endpoint
pub struct HttpChatModel {
    name: String,
    api_url: String,
    api_key: Option<String>,
    model: String,
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatContent,
}

#[derive(Debug, Deserialize)]
struct ChatContent {
    #[serde(default)]
    content: Option<String>,
}

impl HttpChatModel {
    pub fn new(api_url: impl Into<String>, api_key: Option<String>, model: impl Into<String>) -> Self {
        let model = model.into();
        Self {
            name: format!("http:{}", model),
            api_url: api_url.into().trim_end_matches('/').to_string(),
            api_key,
            model,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl LanguageModel for HttpChatModel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(&self, request: &GenerationRequest) -> Result<String, QueryError> {
        let body = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage { role: "system", content: &request.prompt.system },
                ChatMessage { role: "user", content: &request.prompt.user },
            ],
            temperature: 0.1,
        };
        let url = format!("{}/chat/completions", self.api_url);
        debug!("Calling chat model {} at {}", self.model, url);

        let mut req = self.client.post(&url).json(&body);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        let response = req
            .send()
            .await
            .map_err(|e| QueryError::GenerationFailed(format!("{}: {}", self.name, e)))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(QueryError::GenerationFailed(format!("{} returned {}: {}", self.name, status, text)));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| QueryError::GenerationFailed(format!("{}: malformed response: {}", self.name, e)))?;
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| QueryError::GenerationFailed(format!("{} returned no content", self.name)))
    }
}

struct ChainEntry {
    model: Arc<dyn LanguageModel>,
    timeout: Duration,
}

/// Ordered models, each with its own timeout; the first to succeed answers
pub struct ModelChain {
    chain: Vec<ChainEntry>,
}

impl ModelChain {
    pub fn new() -> Self {
        Self { chain: Vec::new() }
    }

    pub fn add(mut self, model: Arc<dyn LanguageModel>, timeout: Duration) -> Self {
        self.chain.push(ChainEntry { model, timeout });
        self
    }

    pub fn len(&self) -> usize {
        self.chain.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chain.is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        self.chain.iter().map(|e| e.model.name().to_string()).collect()
    }
}

impl Default for ModelChain {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LanguageModel for ModelChain {
    fn name(&self) -> &str {
        "chain"
    }

    async fn complete(&self, request: &GenerationRequest) -> Result<String, QueryError> {
        let mut last_error = QueryError::GenerationFailed("no models configured".to_string());
        for (i, entry) in self.chain.iter().enumerate() {
            let model = entry.model.name().to_string();
            info!(model = %model, attempt = i + 1, total = self.chain.len(), "Trying model");
            match tokio::time::timeout(entry.timeout, entry.model.complete(request)).await {
                Ok(Ok(text)) => return Ok(text),
                Ok(Err(e)) => {
                    warn!(model = %model, error = %e, "Model failed, trying next");
                    last_error = e;
                }
                Err(_) => {
                    warn!(model = %model, timeout_ms = entry.timeout.as_millis() as u64, "Model timed out, trying next");
                    last_error = QueryError::GenerationFailed(format!("{} timed out", model));
                }
            }
        }
        Err(last_error)
    }

    async fn stream(&self, request: &GenerationRequest) -> Result<ChunkReceiver, QueryError> {
        let mut last_error = QueryError::GenerationFailed("no models configured".to_string());
        for (i, entry) in self.chain.iter().enumerate() {
            let model = entry.model.name().to_string();
            info!(model = %model, attempt = i + 1, total = self.chain.len(), "Trying model (streaming)");
            match tokio::time::timeout(entry.timeout, entry.model.stream(request)).await {
                Ok(Ok(rx)) => return Ok(rx),
                Ok(Err(e)) => {
                    warn!(model = %model, error = %e, "Model stream failed, trying next");
                    last_error = e;
                }
                Err(_) => {
                    warn!(model = %model, "Model stream timed out, trying next");
                    last_error = QueryError::GenerationFailed(format!("{} timed out", model));
                }
            }
        }
        Err(last_error)
    }
}

/// A complete answer from batch mode
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Answer {
    pub text: String,
    pub model: String,
}

/// How a stream ended, reported to the pipeline
#[derive(Debug, Clone, PartialEq)]
pub struct StreamEnd {
    pub status: StreamStatus,
    /// Concatenation of every segment delivered to the consumer
    pub text: String,
    pub segments: usize,
    pub error: Option<QueryError>,
}

/// Cancels a stream; cheap to clone, idempotent
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Lazy, finite, non-restartable sequence of answer segments
pub struct StreamingAnswer {
    pub answer_id: String,
    rx: mpsc::Receiver<String>,
    cancel: CancelHandle,
    status: watch::Receiver<StreamStatus>,
}

impl StreamingAnswer {
    /// Next segment, or `None` once the stream ended or was cancelled
    pub async fn next(&mut self) -> Option<String> {
        if self.cancel.is_cancelled() {
            return None;
        }
        let segment = self.rx.recv().await?;
        if self.cancel.is_cancelled() {
            return None;
        }
        Some(segment)
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn status(&self) -> StreamStatus {
        *self.status.borrow()
    }

    /// Observe the status without holding the stream
    pub fn status_watch(&self) -> watch::Receiver<StreamStatus> {
        self.status.clone()
    }

    /// Wait for the terminal status
    pub async fn finish(&mut self) -> StreamStatus {
        let result = self
            .status
            .wait_for(|s| *s != StreamStatus::InProgress)
            .await
            .map(|s| *s);
        match result {
            Ok(status) => status,
            Err(_) => *self.status.borrow(),
        }
    }
}

pub struct ResponseGenerator {
    model: Arc<dyn LanguageModel>,
    segment_timeout: Duration,
    generation_timeout: Duration,
}

impl ResponseGenerator {
    pub fn new(model: Arc<dyn LanguageModel>, segment_timeout: Duration, generation_timeout: Duration) -> Self {
        Self {
            model,
            segment_timeout,
            generation_timeout,
        }
    }

    pub fn model_name(&self) -> &str {
        self.model.name()
    }

    /// Block until the whole answer is produced
    pub async fn generate_batch(&self, request: &GenerationRequest) -> Result<Answer, QueryError> {
        match tokio::time::timeout(self.generation_timeout, self.model.complete(request)).await {
            Ok(Ok(text)) => Ok(Answer {
                text,
                model: self.model.name().to_string(),
            }),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(QueryError::GenerationFailed(format!(
                "generation timed out after {}ms",
                self.generation_timeout.as_millis()
            ))),
        }
    }

    /// Start streaming. The returned receiver resolves once the stream ends,
    /// however it ends.
    pub async fn generate_stream(
        &self,
        request: &GenerationRequest,
    ) -> Result<(StreamingAnswer, oneshot::Receiver<StreamEnd>), QueryError> {
        let upstream = match tokio::time::timeout(self.generation_timeout, self.model.stream(request)).await {
            Ok(Ok(rx)) => rx,
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(QueryError::GenerationFailed("model did not start streaming".to_string())),
        };

        let answer_id = Uuid::new_v4().to_string();
        let (out_tx, out_rx) = mpsc::channel(1);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (status_tx, status_rx) = watch::channel(StreamStatus::InProgress);
        let (end_tx, end_rx) = oneshot::channel();

        tokio::spawn(forward(
            answer_id.clone(),
            upstream,
            out_tx,
            cancel_rx,
            status_tx,
            end_tx,
            self.segment_timeout,
        ));

        let answer = StreamingAnswer {
            answer_id,
            rx: out_rx,
            cancel: CancelHandle { tx: Arc::new(cancel_tx) },
            status: status_rx,
        };
        Ok((answer, end_rx))
    }
}

async fn forward(
    answer_id: String,
    mut upstream: ChunkReceiver,
    out: mpsc::Sender<String>,
    mut cancel: watch::Receiver<bool>,
    status_tx: watch::Sender<StreamStatus>,
    end_tx: oneshot::Sender<StreamEnd>,
    segment_timeout: Duration,
) {
    let mut text = String::new();
    let mut segments = 0usize;

    let (status, error) = loop {
        if *cancel.borrow_and_update() {
            break (StreamStatus::Cancelled, None);
        }
        let next = tokio::select! {
            biased;
            changed = cancel.changed() => {
                // A dropped handle means nobody is listening any more
                if changed.is_err() || *cancel.borrow() {
                    break (StreamStatus::Cancelled, None);
                }
                continue;
            }
            next = tokio::time::timeout(segment_timeout, upstream.recv()) => next,
        };

        match next {
            Ok(Some(Ok(segment))) => {
                if *cancel.borrow() {
                    break (StreamStatus::Cancelled, None);
                }
                let sent = tokio::select! {
                    biased;
                    _ = cancel.changed() => false,
                    sent = out.send(segment.clone()) => sent.is_ok(),
                };
                if !sent || *cancel.borrow() {
                    break (StreamStatus::Cancelled, None);
                }
                segments += 1;
                text.push_str(&segment);
            }
            Ok(Some(Err(e))) => break (StreamStatus::Error, Some(e)),
            Ok(None) => break (StreamStatus::Complete, None),
            Err(_) => {
                break (
                    StreamStatus::Error,
                    Some(QueryError::GenerationFailed(format!(
                        "no segment within {}ms",
                        segment_timeout.as_millis()
                    ))),
                )
            }
        }
    };

    // Dropping the upstream receiver stops the producer
    drop(upstream);
    info!(answer_id = %answer_id, status = ?status, segments, "Stream finished");
    status_tx.send_replace(status);
    let _ = end_tx.send(StreamEnd {
        status,
        text,
        segments,
        error,
    });
}
