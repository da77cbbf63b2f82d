//! floatquery - conversational query orchestration over Argo float data
//!
//! Turns a free-text or structured question into an answer with:
//! - Intent classification with explicit precedence
//! - Hybrid retrieval (nearest-neighbour, range filters, vector search) under a budget
//! - Single-flight response caching per query fingerprint
//! - One bounded escalation to a secondary source
//! - Streamed generation with cooperative cancellation
//! - Bounded per-session conversation memory

pub mod types;
pub mod error;
pub mod vocabulary;
pub mod classifier;
pub mod scoring;
pub mod selection;
pub mod store;
pub mod http_store;
pub mod retriever;
pub mod fallback;
pub mod cache;
pub mod generator;
pub mod session;
pub mod engine;
pub mod config;
pub mod server;

pub use types::*;
pub use error::{QueryError, StoreError};
pub use classifier::QueryClassifier;
pub use store::{ContextStore, InMemoryStore, MeasurementRecord};
pub use http_store::HttpContextStore;
pub use retriever::{ContextRetriever, RetrievalConfig};
pub use fallback::{EscalationSource, FallbackRouter, KnowledgeBase};
pub use cache::{CachePolicy, Fingerprint, ResponseCache};
pub use generator::{ExtractiveModel, HttpChatModel, LanguageModel, ModelChain, ResponseGenerator, StreamingAnswer};
pub use session::SessionStore;
pub use engine::{QueryEngine, QueryResponse, SharedQueryEngine};
pub use config::Config;
