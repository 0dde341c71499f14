//! HTTP API for rate lookups.

use anyhow::{Context, Result};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::error::RateError;
use crate::rates::RateCache;

/// Shared application state, passed to all route handlers via `axum::extract::State`.
#[derive(Clone)]
pub struct AppState {
    pub rates: Arc<RateCache>,
}

/// Error type for API responses.
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Internal(String),
}

impl ApiError {
    /// Keeps upstream details in the log and out of the response.
    fn from_rate(err: RateError, message: &str) -> Self {
        if err.is_client_error() {
            return ApiError::BadRequest(err.to_string());
        }
        error!(error = %err, "{message}");
        ApiError::Internal(message.to_string())
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BadRequest(msg) => write!(f, "bad_request: {msg}"),
            Self::Internal(msg) => write!(f, "internal_error: {msg}"),
        }
    }
}

impl std::error::Error for ApiError {}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            Self::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        (status, Json(json!({ "error": message }))).into_response()
    }
}

#[derive(Debug, Deserialize)]
pub struct RateQuery {
    base: Option<String>,
    #[serde(alias = "quote")]
    to: Option<String>,
    amount: Option<f64>,
}

impl RateQuery {
    fn pair(&self) -> Result<(&str, &str), ApiError> {
        match (present(&self.base), present(&self.to)) {
            (Some(base), Some(to)) => Ok((base, to)),
            _ => Err(ApiError::BadRequest(
                "Base currency and conversion currency must be provided".to_string(),
            )),
        }
    }
}

fn present(value: &Option<String>) -> Option<&str> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

/// Assemble the API router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/convert/convert", get(convert))
        .route("/convert/exch", get(exchange_rate))
        .route("/convert/health", get(health))
        .route("/health", get(health))
        .with_state(state)
}

/// GET /convert/exch?base=..&to=..: units of `to` per one `base`.
async fn exchange_rate(
    State(state): State<AppState>,
    Query(query): Query<RateQuery>,
) -> Result<Json<f64>, ApiError> {
    let (base, to) = query.pair()?;
    let rate = state
        .rates
        .get_rate(base, to)
        .await
        .map_err(|e| ApiError::from_rate(e, "Failed to get exchange rate"))?;
    Ok(Json(rate))
}

/// GET /convert/convert?base=..&to=..[&amount=..]: `"<converted> <to>"`.
async fn convert(
    State(state): State<AppState>,
    Query(query): Query<RateQuery>,
) -> Result<Json<String>, ApiError> {
    let (base, to) = query.pair()?;
    let amount = query.amount.unwrap_or(1.0);
    if !amount.is_finite() || amount <= 0.0 {
        return Err(ApiError::BadRequest(
            "Amount must be a positive number".to_string(),
        ));
    }

    let rate = state
        .rates
        .get_rate(base, to)
        .await
        .map_err(|e| ApiError::from_rate(e, "Failed to convert currencies"))?;
    Ok(Json(format!("{} {}", rate * amount, to)))
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

/// Serves the API on `listener` until Ctrl+C.
pub async fn serve(listener: TcpListener, state: AppState) -> Result<()> {
    let addr = listener.local_addr()?;
    info!("xrate listening on http://{addr}");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server failed")
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to install Ctrl+C handler");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received, gracefully stopping…");
}
