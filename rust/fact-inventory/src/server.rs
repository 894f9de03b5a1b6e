use crate::{
    config::AppConfig,
    error::{IngestError, Result},
    ingest::{log_failure, IngestService},
    rate_limit::RateLimiter,
    repository::{self, FactRepository},
    state::AppState,
    validation::{parse_client_address, FactValidator},
};
use axum::{
    body::Bytes,
    extract::{rejection::BytesRejection, ConnectInfo, DefaultBodyLimit, State},
    http::{HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use std::{net::SocketAddr, sync::Arc};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;
use uuid::Uuid;

const FORWARDED_FOR: &str = "x-forwarded-for";

pub struct Server {
    config: Arc<AppConfig>,
    state: AppState,
}

#[derive(Debug, Serialize)]
struct CreatedBody {
    id: Uuid,
    created_at: DateTime<Utc>,
    detail: String,
}

impl Server {
    pub async fn new(config: AppConfig) -> anyhow::Result<Self> {
        let repository = repository::connect(&config).await?;
        Ok(Self::with_repository(config, repository))
    }

    /// Assemble the service around an already-built repository.
    pub fn with_repository(config: AppConfig, repository: Arc<dyn FactRepository>) -> Self {
        let config = Arc::new(config);
        let validator = FactValidator::new(config.limits);
        let limiter = RateLimiter::new(&config.rate_limit, Arc::clone(&repository));
        let ingest = IngestService::new(validator, limiter, repository);
        let state = AppState::new(Arc::clone(&config), ingest);

        Self { config, state }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/healthz", get(Self::health))
            .route("/v1/facts", post(Self::submit))
            .layer(DefaultBodyLimit::max(self.config.limits.max_body_bytes))
            .with_state(self.state.clone())
            .layer(TraceLayer::new_for_http())
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let addr = self.config.listen_addr;
        let _sweeper = self
            .state
            .ingest
            .limiter()
            .spawn_sweeper(self.config.rate_limit.sweep_interval);

        let listener = TcpListener::bind(addr).await?;
        info!(
            %addr,
            rate_limit_minutes = self.config.rate_limit.interval.as_secs() / 60,
            "fact inventory listening"
        );
        axum::serve(
            listener,
            self.router()
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await?;
        Ok(())
    }

    async fn health() -> Json<serde_json::Value> {
        Json(json!({ "status": "ok" }))
    }

    async fn submit(
        State(state): State<AppState>,
        connect_info: Option<ConnectInfo<SocketAddr>>,
        headers: HeaderMap,
        body: std::result::Result<Bytes, BytesRejection>,
    ) -> Result<(StatusCode, Json<CreatedBody>)> {
        let client_address = client_address(&headers, connect_info, &state.config);
        let body = accept_body(&state, &client_address, body).map_err(|err| {
            log_failure(&client_address, &err);
            err
        })?;

        // Run on its own task so a client hanging up cannot cancel a write
        // that is already in flight.
        let ingest = state.ingest.clone();
        let task_address = client_address.clone();
        let receipt = tokio::spawn(async move {
            ingest.submit(&body, &task_address, Utc::now()).await
        })
        .await
        .map_err(|err| {
            let err = IngestError::Internal(anyhow::anyhow!("submission task failed: {err}"));
            log_failure(&client_address, &err);
            err
        })??;

        Ok((
            StatusCode::CREATED,
            Json(CreatedBody {
                id: receipt.id,
                created_at: receipt.created_at,
                detail: format!("Facts stored successfully for {}", receipt.client_address),
            }),
        ))
    }
}

/// Check the address before anything about the body, then surface extractor
/// rejections as submission errors.
fn accept_body(
    state: &AppState,
    client_address: &str,
    body: std::result::Result<Bytes, BytesRejection>,
) -> Result<Bytes> {
    parse_client_address(client_address)?;
    body.map_err(|rejection| {
        if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
            IngestError::PayloadTooLarge(format!(
                "request body exceeds maximum size of {} bytes",
                state.config.limits.max_body_bytes
            ))
        } else {
            IngestError::SchemaViolation(rejection.body_text())
        }
    })
}

/// Pick the address a submission is attributed to. The forwarded header is
/// only honoured when the deployment says a trusted proxy sets it.
fn client_address(
    headers: &HeaderMap,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    config: &AppConfig,
) -> String {
    if config.trust_forwarded_for {
        let forwarded = headers
            .get(FORWARDED_FOR)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.split(',').next())
            .map(str::trim)
            .filter(|value| !value.is_empty());
        if let Some(forwarded) = forwarded {
            return forwarded.to_string();
        }
    }

    connect_info
        .map(|ConnectInfo(peer)| peer.ip().to_string())
        .unwrap_or_default()
}
