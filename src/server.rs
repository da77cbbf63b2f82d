//! HTTP surface for the float query pipeline

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{
        sse::{Event as SseEvent, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tracing::{error, info, warn};

use crate::engine::{QueryResponse, SharedQueryEngine, StatusReport};
use crate::error::QueryError;
use crate::types::{
    DateRange, GenerationMode, IntentKind, Query, SpatialFilter, StreamStatus, StructuredFilters,
};

/// Free-text query, optionally with filters
#[derive(Debug, Deserialize)]
pub struct QueryRequestHttp {
    pub text: String,
    #[serde(default)]
    pub filters: Option<StructuredFilters>,
    pub session_id: String,
    #[serde(default)]
    pub mode: Option<GenerationMode>,
}

#[derive(Debug, Deserialize)]
pub struct SpatialQueryHttp {
    pub lat: f64,
    pub lon: f64,
    #[serde(default)]
    pub radius_km: Option<f64>,
    #[serde(default)]
    pub parameters: Vec<String>,
    #[serde(default)]
    pub start: Option<NaiveDate>,
    #[serde(default)]
    pub end: Option<NaiveDate>,
    #[serde(default)]
    pub text: Option<String>,
    pub session_id: String,
    #[serde(default)]
    pub mode: Option<GenerationMode>,
}

#[derive(Debug, Deserialize)]
pub struct TemporalQueryHttp {
    pub start: NaiveDate,
    pub end: NaiveDate,
    #[serde(default)]
    pub parameters: Vec<String>,
    #[serde(default)]
    pub regions: Vec<String>,
    #[serde(default)]
    pub text: Option<String>,
    pub session_id: String,
    #[serde(default)]
    pub mode: Option<GenerationMode>,
}

#[derive(Debug, Deserialize)]
pub struct BgcQueryHttp {
    pub parameters: Vec<String>,
    #[serde(default)]
    pub regions: Vec<String>,
    #[serde(default)]
    pub start: Option<NaiveDate>,
    #[serde(default)]
    pub end: Option<NaiveDate>,
    #[serde(default)]
    pub text: Option<String>,
    pub session_id: String,
    #[serde(default)]
    pub mode: Option<GenerationMode>,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub details: Option<String>,
    pub retry_safe: bool,
}

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
}

#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub stream_handle: String,
    pub status: StreamStatus,
}

#[derive(Debug, Serialize)]
struct StreamEndEvent {
    status: StreamStatus,
}

/// `QueryError` as an HTTP response
pub struct ApiError(pub QueryError);

impl From<QueryError> for ApiError {
    fn from(err: QueryError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            QueryError::InvalidFilter(_) | QueryError::ClassificationAmbiguous(_) => StatusCode::BAD_REQUEST,
            QueryError::UnknownStream(_) => StatusCode::NOT_FOUND,
            QueryError::CancellationRequested => StatusCode::CONFLICT,
            QueryError::RetrievalUnavailable(_)
            | QueryError::InsufficientContext(_)
            | QueryError::GenerationFailed(_)
            | QueryError::LeaseExpired => StatusCode::SERVICE_UNAVAILABLE,
        };
        let body = ErrorResponse {
            error: match &self.0 {
                QueryError::InvalidFilter(_) => "Invalid query".to_string(),
                QueryError::UnknownStream(_) => "Unknown stream".to_string(),
                _ => "Query failed".to_string(),
            },
            details: Some(self.0.to_string()),
            retry_safe: self.0.is_retry_safe(),
        };
        (status, Json(body)).into_response()
    }
}

fn date_range(start: Option<NaiveDate>, end: Option<NaiveDate>) -> Option<DateRange> {
    match (start, end) {
        (Some(start), Some(end)) => Some(DateRange::new(start, end)),
        (Some(day), None) | (None, Some(day)) => Some(DateRange::new(day, day)),
        (None, None) => None,
    }
}

async fn run_query(
    engine: &SharedQueryEngine,
    query: Query,
    mode: Option<GenerationMode>,
) -> Result<Json<QueryResponse>, ApiError> {
    let mode = mode.unwrap_or(GenerationMode::Stream);
    match engine.submit(query, mode).await {
        Ok(response) => {
            info!(
                kind = ?response.intent_kind,
                status = ?response.status,
                used_fallback = response.used_fallback,
                cached = response.cached,
                "Query answered"
            );
            Ok(Json(response))
        }
        Err(e) => {
            error!("Query failed: {}", e);
            Err(e.into())
        }
    }
}

/// Submit query handler
async fn query_handler(
    State(engine): State<SharedQueryEngine>,
    Json(req): Json<QueryRequestHttp>,
) -> Result<Json<QueryResponse>, ApiError> {
    info!(session_id = %req.session_id, "Received query request");
    let mut query = Query::new(req.text, req.session_id);
    query.filters = req.filters;
    run_query(&engine, query, req.mode).await
}

async fn spatial_query_handler(
    State(engine): State<SharedQueryEngine>,
    Json(req): Json<SpatialQueryHttp>,
) -> Result<Json<QueryResponse>, ApiError> {
    let radius_km = req.radius_km.unwrap_or(crate::classifier::DEFAULT_RADIUS_KM);
    let text = req.text.unwrap_or_else(|| {
        let what = if req.parameters.is_empty() {
            "measurements".to_string()
        } else {
            req.parameters.join(" and ")
        };
        format!("{} near {}, {} within {} km", what, req.lat, req.lon, radius_km)
    });
    let filters = StructuredFilters {
        spatial: Some(SpatialFilter {
            lat: req.lat,
            lon: req.lon,
            radius_km,
        }),
        temporal: date_range(req.start, req.end),
        parameters: req.parameters,
        intent_hint: Some(IntentKind::Spatial),
        ..Default::default()
    };
    run_query(&engine, Query::new(text, req.session_id).with_filters(filters), req.mode).await
}

async fn temporal_query_handler(
    State(engine): State<SharedQueryEngine>,
    Json(req): Json<TemporalQueryHttp>,
) -> Result<Json<QueryResponse>, ApiError> {
    let text = req.text.unwrap_or_else(|| {
        let what = if req.parameters.is_empty() {
            "measurements".to_string()
        } else {
            req.parameters.join(" and ")
        };
        format!("{} from {} to {}", what, req.start, req.end)
    });
    let filters = StructuredFilters {
        temporal: Some(DateRange::new(req.start, req.end)),
        parameters: req.parameters,
        regions: req.regions,
        intent_hint: Some(IntentKind::Temporal),
        ..Default::default()
    };
    run_query(&engine, Query::new(text, req.session_id).with_filters(filters), req.mode).await
}

async fn bgc_query_handler(
    State(engine): State<SharedQueryEngine>,
    Json(req): Json<BgcQueryHttp>,
) -> Result<Json<QueryResponse>, ApiError> {
    if req.parameters.is_empty() {
        return Err(QueryError::InvalidFilter("at least one parameter is required".to_string()).into());
    }
    let text = req.text.unwrap_or_else(|| {
        let mut text = format!("{} profiles", req.parameters.join(" and "));
        if !req.regions.is_empty() {
            text.push_str(&format!(" in the {}", req.regions.join(" and ")));
        }
        text
    });
    let filters = StructuredFilters {
        temporal: date_range(req.start, req.end),
        parameters: req.parameters,
        regions: req.regions,
        intent_hint: Some(IntentKind::Biogeochemical),
        ..Default::default()
    };
    run_query(&engine, Query::new(text, req.session_id).with_filters(filters), req.mode).await
}

/// Server-sent segments, then one `end` event carrying the terminal status
async fn stream_handler(
    State(engine): State<SharedQueryEngine>,
    Path(handle): Path<String>,
) -> Result<Sse<impl futures::Stream<Item = Result<SseEvent, Infallible>>>, ApiError> {
    let mut answer = engine.take_stream(&handle)?;
    info!(handle = %handle, "Stream claimed");

    let (tx, rx) = mpsc::channel::<SseEvent>(16);
    tokio::spawn(async move {
        while let Some(segment) = answer.next().await {
            if tx.send(SseEvent::default().event("segment").data(segment)).await.is_err() {
                warn!(handle = %answer.answer_id, "Client went away, cancelling stream");
                answer.cancel();
                return;
            }
        }
        let status = answer.finish().await;
        let data = serde_json::to_string(&StreamEndEvent { status }).unwrap_or_default();
        let _ = tx.send(SseEvent::default().event("end").data(data)).await;
    });

    let stream = ReceiverStream::new(rx).map(Ok);
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

async fn cancel_handler(
    State(engine): State<SharedQueryEngine>,
    Path(handle): Path<String>,
) -> Result<Json<CancelResponse>, ApiError> {
    let status = engine.cancel_stream(&handle)?;
    let status = if status == StreamStatus::InProgress {
        StreamStatus::Cancelled
    } else {
        status
    };
    Ok(Json(CancelResponse {
        stream_handle: handle,
        status,
    }))
}

async fn status_handler(State(engine): State<SharedQueryEngine>) -> Json<StatusReport> {
    Json(engine.status().await)
}

/// Health check handler
async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        service: "floatquery".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Create and configure the HTTP server
pub fn create_router(engine: SharedQueryEngine) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/status", get(status_handler))
        .route("/query", post(query_handler))
        .route("/query/spatial", post(spatial_query_handler))
        .route("/query/temporal", post(temporal_query_handler))
        .route("/query/bgc", post(bgc_query_handler))
        .route("/query/stream/:handle", get(stream_handler))
        .route("/query/cancel/:handle", post(cancel_handler))
        .with_state(engine)
}

/// Run the HTTP server
pub async fn run_server(engine: SharedQueryEngine, bind: &str, port: u16) -> anyhow::Result<()> {
    let addr = format!("{}:{}", bind, port);
    info!("Starting floatquery server on {}", addr);

    let app = create_router(engine);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Server listening on {}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}
