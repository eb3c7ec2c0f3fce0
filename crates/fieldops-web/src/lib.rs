//! Axum JSON API over the dispatch engine.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Path, Query, State,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use fieldops_core::{
    DispatchError, PriceBreakdown, RequestStatus, ServiceRequest, SystemClock, Urgency, Worker,
};
use fieldops_engine::{LifecycleManager, NewServiceRequest, PricingConfig, TransitionExtra};
use fieldops_storage::{
    LogNotifier, MemoryStore, NotificationSink, PgStore, Repository, WebhookConfig, WebhookNotifier,
};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{info, warn};
use uuid::Uuid;

mod error;

pub use error::{ApiError, ErrorBody};

pub const CRATE_NAME: &str = "fieldops-web";

const DEFAULT_PORT: u16 = 8000;
const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 10;
const DB_MAX_CONNECTIONS: u32 = 10;

#[derive(Clone)]
pub struct AppState {
    pub lifecycle: Arc<LifecycleManager>,
}

impl AppState {
    pub fn new(lifecycle: LifecycleManager) -> Self {
        Self {
            lifecycle: Arc::new(lifecycle),
        }
    }
}

/// Process configuration, read from the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// `None` runs against an empty in-memory store.
    pub database_url: Option<String>,
    pub port: u16,
    pub pricing_file: Option<PathBuf>,
    pub webhook_url: Option<String>,
    pub http_timeout: Duration,
}

impl ServerConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let non_empty = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let port = match non_empty("FIELDOPS_WEB_PORT") {
            Some(raw) => raw
                .parse()
                .with_context(|| format!("FIELDOPS_WEB_PORT is not a port: {raw}"))?,
            None => DEFAULT_PORT,
        };
        let timeout_secs = match non_empty("FIELDOPS_HTTP_TIMEOUT_SECS") {
            Some(raw) => raw
                .parse()
                .with_context(|| format!("FIELDOPS_HTTP_TIMEOUT_SECS is not a number: {raw}"))?,
            None => DEFAULT_HTTP_TIMEOUT_SECS,
        };

        Ok(Self {
            database_url: non_empty("DATABASE_URL"),
            port,
            pricing_file: non_empty("FIELDOPS_PRICING_FILE").map(PathBuf::from),
            webhook_url: non_empty("FIELDOPS_NOTIFY_WEBHOOK_URL"),
            http_timeout: Duration::from_secs(timeout_secs),
        })
    }

    pub fn pricing_config(&self) -> anyhow::Result<PricingConfig> {
        match &self.pricing_file {
            Some(path) => PricingConfig::from_yaml_file(path),
            None => Ok(PricingConfig::default()),
        }
    }

    pub async fn repository(&self) -> anyhow::Result<Arc<dyn Repository>> {
        match &self.database_url {
            Some(url) => Ok(Arc::new(PgStore::connect(url, DB_MAX_CONNECTIONS).await?)),
            None => {
                warn!("DATABASE_URL not set; using an empty in-memory store");
                Ok(Arc::new(MemoryStore::new()))
            }
        }
    }

    pub fn notifier(&self) -> anyhow::Result<Arc<dyn NotificationSink>> {
        match &self.webhook_url {
            Some(url) => Ok(Arc::new(WebhookNotifier::new(WebhookConfig {
                url: url.clone(),
                timeout: self.http_timeout,
                user_agent: Some(format!("{CRATE_NAME}/{}", env!("CARGO_PKG_VERSION"))),
            })?)),
            None => Ok(Arc::new(LogNotifier)),
        }
    }

    pub async fn lifecycle(&self) -> anyhow::Result<LifecycleManager> {
        Ok(LifecycleManager::new(
            self.repository().await?,
            self.pricing_config()?,
            self.notifier()?,
            Arc::new(SystemClock),
        ))
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/price-quote", get(price_quote_handler))
        .route(
            "/service-requests",
            post(create_request_handler).get(list_requests_handler),
        )
        .route(
            "/service-requests/{id}",
            get(get_request_handler).delete(delete_request_handler),
        )
        .route("/service-requests/{id}/assign", post(assign_handler))
        .route("/service-requests/{id}/status", post(status_handler))
        .route("/service-requests/{id}/eligible-workers", get(eligible_workers_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(config: ServerConfig) -> anyhow::Result<()> {
    let state = AppState::new(config.lifecycle().await?);
    let listener = TcpListener::bind(("0.0.0.0", config.port))
        .await
        .with_context(|| format!("binding port {}", config.port))?;
    info!(port = config.port, "fieldops api listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    serve(ServerConfig::from_env()?).await
}

#[derive(Debug, Deserialize)]
struct QuoteQuery {
    service_id: Uuid,
    zone_id: Uuid,
    time: Option<DateTime<Utc>>,
    urgency: Option<Urgency>,
}

#[derive(Debug, Serialize)]
struct QuoteResponse {
    final_price: f64,
    breakdown: PriceBreakdown,
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    requester_id: Option<Uuid>,
    worker_id: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
struct AssignBody {
    worker_id: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
struct StatusBody {
    status: String,
    #[serde(flatten)]
    extra: TransitionExtra,
}

type Shared = State<Arc<AppState>>;

async fn healthz_handler() -> &'static str {
    "ok"
}

async fn price_quote_handler(
    State(state): Shared,
    query: Result<Query<QuoteQuery>, QueryRejection>,
) -> Result<Json<QuoteResponse>, ApiError> {
    let Query(query) = query?;
    let breakdown = state
        .lifecycle
        .quote(query.service_id, query.zone_id, query.time, query.urgency)
        .await?;
    Ok(Json(QuoteResponse {
        final_price: breakdown.final_price,
        breakdown,
    }))
}

async fn create_request_handler(
    State(state): Shared,
    body: Result<Json<NewServiceRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(input) = body?;
    let request = state.lifecycle.create(input).await?;
    Ok((StatusCode::CREATED, Json(request)))
}

async fn list_requests_handler(
    State(state): Shared,
    query: Result<Query<ListQuery>, QueryRejection>,
) -> Result<Json<Vec<ServiceRequest>>, ApiError> {
    let Query(query) = query?;
    let requests = match (query.requester_id, query.worker_id) {
        (Some(requester_id), None) => state.lifecycle.list_for_requester(requester_id).await?,
        (None, Some(worker_id)) => state.lifecycle.list_for_worker(worker_id).await?,
        _ => {
            return Err(ApiError::invalid(
                "exactly one of requester_id or worker_id is required",
            ))
        }
    };
    Ok(Json(requests))
}

async fn get_request_handler(
    State(state): Shared,
    Path(id): Path<Uuid>,
) -> Result<Json<ServiceRequest>, ApiError> {
    Ok(Json(state.lifecycle.get(id).await?))
}

async fn delete_request_handler(
    State(state): Shared,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    state.lifecycle.delete(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn assign_handler(
    State(state): Shared,
    Path(id): Path<Uuid>,
    body: Result<Json<AssignBody>, JsonRejection>,
) -> Result<Json<ServiceRequest>, ApiError> {
    let Json(body) = body?;
    let worker_id = body
        .worker_id
        .ok_or_else(|| DispatchError::MissingFields(vec!["worker_id".into()]))?;
    Ok(Json(state.lifecycle.assign_worker(id, worker_id).await?))
}

async fn status_handler(
    State(state): Shared,
    Path(id): Path<Uuid>,
    body: Result<Json<StatusBody>, JsonRejection>,
) -> Result<Json<ServiceRequest>, ApiError> {
    let Json(body) = body?;
    let status: RequestStatus = body.status.parse()?;
    Ok(Json(state.lifecycle.transition_status(id, status, body.extra).await?))
}

async fn eligible_workers_handler(
    State(state): Shared,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<Worker>>, ApiError> {
    Ok(Json(state.lifecycle.eligible_workers(id).await?))
}
