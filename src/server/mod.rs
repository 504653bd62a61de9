use crate::cli::AppConfig;
use crate::providers::{HttpModelClient, ModelClient};
use crate::resilience::breaker::CircuitBreaker;
use crate::resilience::logger::ErrorLogger;
use crate::resilience::orchestrator::{EndpointFailure, FallbackOrchestrator, InvokeError, InvokeOptions};
use crate::store::{self, ErrorLogSink, StoreError};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router as AxumRouter,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

const DEFAULT_ERROR_LIMIT: usize = 50;
const MAX_ERROR_LIMIT: usize = 1000;

/// Application state shared across handlers
pub struct AppState<C: ModelClient> {
    pub orchestrator: FallbackOrchestrator<C>,
    pub errors: Arc<dyn ErrorLogSink>,
}

impl<C: ModelClient> AppState<C> {
    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        self.orchestrator.breaker()
    }

    /// Wait for queued error log entries to be written
    pub async fn flush(&self) {
        self.orchestrator.logger().flush().await;
    }
}

impl AppState<HttpModelClient> {
    /// Open the store and wire up the full stack from configuration
    pub async fn from_config(config: &AppConfig) -> anyhow::Result<Self> {
        let handles = store::open(&config.store)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to open store: {}", e))?;

        let client = HttpModelClient::new(config.client.http_config())
            .map_err(|e| anyhow::anyhow!("Failed to initialize model client: {}", e))?;

        let breaker_config = config.breaker.breaker_config();
        info!(
            "🛡️  Breaker: threshold {} / timeout {}s ({} endpoint overrides)",
            breaker_config.defaults.failure_threshold,
            breaker_config.defaults.timeout.as_secs(),
            breaker_config.endpoints.len()
        );
        let breaker = Arc::new(CircuitBreaker::new(handles.breakers.clone(), breaker_config));
        let logger = ErrorLogger::spawn(handles.errors.clone(), config.logger.channel_capacity);

        let orchestrator = FallbackOrchestrator::new(Arc::new(client), breaker, logger)
            .with_classifier(Arc::new(config.classifier.classifier()))
            .with_retry_policy(config.retry.policy());

        Ok(Self {
            orchestrator,
            errors: handles.errors,
        })
    }
}

/// Build the HTTP API over `state`
pub fn app<C>(state: Arc<AppState<C>>) -> AxumRouter
where
    C: ModelClient<Request = Value, Response = Value> + 'static,
{
    AxumRouter::new()
        .route("/health", get(health_check))
        .route("/v1/invoke", post(handle_invoke::<C>))
        .route("/v1/breakers", get(list_breakers::<C>))
        .route("/v1/breakers/:endpoint", get(get_breaker::<C>))
        .route("/v1/breakers/:endpoint/reset", post(reset_breaker::<C>))
        .route("/v1/errors", get(recent_errors::<C>))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the HTTP server
pub async fn start_server(config: AppConfig) -> anyhow::Result<()> {
    let state = Arc::new(AppState::from_config(&config).await?);
    let app = app(state.clone());

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("🚀 Server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    state.flush().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutting down");
}

async fn health_check() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "llm-resilience",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

#[derive(Debug, Deserialize)]
struct InvokeBody {
    endpoints: Vec<String>,
    request: Value,
    deadline_ms: Option<u64>,
}

async fn handle_invoke<C>(
    State(state): State<Arc<AppState<C>>>,
    Json(body): Json<InvokeBody>,
) -> Result<Json<Value>, AppError>
where
    C: ModelClient<Request = Value, Response = Value> + 'static,
{
    if body.endpoints.is_empty() {
        return Err(AppError::BadRequest("endpoints must not be empty".to_string()));
    }
    if !body.request.is_object() {
        return Err(AppError::BadRequest("request must be a JSON object".to_string()));
    }

    let mut options = InvokeOptions::default();
    if let Some(ms) = body.deadline_ms {
        options = options.with_deadline(Duration::from_millis(ms));
    }

    let response = state
        .orchestrator
        .invoke(&body.endpoints, &body.request, options)
        .await?;
    Ok(Json(response))
}

async fn list_breakers<C: ModelClient + 'static>(
    State(state): State<Arc<AppState<C>>>,
) -> Result<impl IntoResponse, AppError> {
    let records = state.breaker().list().await?;
    Ok(Json(records))
}

async fn get_breaker<C: ModelClient + 'static>(
    State(state): State<Arc<AppState<C>>>,
    Path(endpoint): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let record = state.breaker().snapshot(&endpoint).await?;
    Ok(Json(record))
}

async fn reset_breaker<C: ModelClient + 'static>(
    State(state): State<Arc<AppState<C>>>,
    Path(endpoint): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let record = state.breaker().reset(&endpoint).await?;
    info!("🔄 Circuit for '{}' reset via API", endpoint);
    Ok(Json(record))
}

#[derive(Debug, Deserialize)]
struct ErrorQuery {
    endpoint: Option<String>,
    limit: Option<usize>,
}

async fn recent_errors<C: ModelClient + 'static>(
    State(state): State<Arc<AppState<C>>>,
    Query(query): Query<ErrorQuery>,
) -> Result<impl IntoResponse, AppError> {
    let limit = query.limit.unwrap_or(DEFAULT_ERROR_LIMIT).min(MAX_ERROR_LIMIT);
    let entries = state.errors.recent(query.endpoint.as_deref(), limit).await?;
    Ok(Json(entries))
}

/// JSON view of one failed endpoint
pub fn failure_json(failure: &EndpointFailure) -> Value {
    json!({
        "endpoint": failure.endpoint,
        "reason": failure.to_string(),
        "severity": failure.severity().map(|s| s.as_str()),
        "kind": failure.kind(),
        "attempts": failure.attempts(),
        "retry_after_ms": failure.retry_after().map(|d| d.as_millis() as u64),
    })
}

/// Application error types
#[derive(Debug)]
pub enum AppError {
    BadRequest(String),
    Invoke(InvokeError),
    Store(StoreError),
}

impl From<InvokeError> for AppError {
    fn from(e: InvokeError) -> Self {
        AppError::Invoke(e)
    }
}

impl From<StoreError> for AppError {
    fn from(e: StoreError) -> Self {
        AppError::Store(e)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let message = self.to_string();
        let (status, kind, endpoints) = match self {
            AppError::BadRequest(_) => (StatusCode::BAD_REQUEST, "invalid_request", Vec::new()),
            AppError::Store(_) => (StatusCode::SERVICE_UNAVAILABLE, "store_unavailable", Vec::new()),
            AppError::Invoke(e) => match e {
                InvokeError::Fatal { error, attempts, earlier } => {
                    let mut endpoints: Vec<Value> = earlier.iter().map(failure_json).collect();
                    endpoints.push(json!({
                        "endpoint": error.endpoint(),
                        "reason": error.message(),
                        "severity": error.severity().as_str(),
                        "kind": error.kind(),
                        "attempts": attempts,
                        "retry_after_ms": null,
                    }));
                    (StatusCode::FAILED_DEPENDENCY, "fatal", endpoints)
                }
                InvokeError::Terminal(terminal) => (
                    StatusCode::BAD_GATEWAY,
                    "terminal",
                    terminal.failures.iter().map(failure_json).collect(),
                ),
                InvokeError::Cancelled { earlier, .. } => (
                    StatusCode::GATEWAY_TIMEOUT,
                    "cancelled",
                    earlier.iter().map(failure_json).collect(),
                ),
            },
        };

        let body = Json(json!({
            "error": {
                "type": kind,
                "message": message,
                "endpoints": endpoints,
            }
        }));

        (status, body).into_response()
    }
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::Invoke(e) => write!(f, "{}", e),
            AppError::Store(e) => write!(f, "Store error: {}", e),
        }
    }
}

impl std::error::Error for AppError {}
