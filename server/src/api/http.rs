use axum::{
    body::Bytes,
    extract::State as AxumState,
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use miam_types::api::RegisterRequest;
use miam_types::NewParticipant;
use miam_execution::RegistryError;
use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;
use std::time::Instant;

use crate::error::ApiError;
use crate::Drawer;

#[derive(Serialize)]
struct HealthzResponse {
    ok: bool,
}

/// Decodes a JSON request body, mapping malformed input to a 400 `ErrorResponse`.
pub(super) fn decode_json<T: DeserializeOwned>(body: &Bytes) -> Result<T, ApiError> {
    Ok(serde_json::from_slice(body)?)
}

/// Like [`decode_json`], but an empty body yields `T::default()`.
pub(super) fn decode_json_or_default<T: DeserializeOwned + Default>(
    body: &Bytes,
) -> Result<T, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    decode_json(body)
}

pub(super) async fn healthz() -> Response {
    Json(HealthzResponse { ok: true }).into_response()
}

pub(super) async fn status(AxumState(drawer): AxumState<Arc<Drawer>>) -> Response {
    let start = Instant::now();
    let status = drawer.status(chrono::Utc::now()).await;
    drawer.http_metrics().record_status(start.elapsed());
    Json(status).into_response()
}

pub(super) async fn register(
    AxumState(drawer): AxumState<Arc<Drawer>>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let start = Instant::now();
    let req: RegisterRequest = decode_json(&body)?;
    let input = NewParticipant::parse(&req.name, &req.surname, &req.email)
        .map_err(RegistryError::from)?;
    let result = drawer.register(input).await;
    drawer.http_metrics().record_register(start.elapsed());
    let participant = result?;
    Ok((StatusCode::CREATED, Json(participant)).into_response())
}

pub(super) async fn metrics(
    headers: HeaderMap,
    AxumState(drawer): AxumState<Arc<Drawer>>,
) -> Response {
    if let Some(status) = metrics_auth_error(&headers) {
        return status.into_response();
    }
    Json(drawer.metrics()).into_response()
}

fn metrics_auth_error(headers: &HeaderMap) -> Option<StatusCode> {
    let token = std::env::var("METRICS_AUTH_TOKEN").unwrap_or_default();
    if token.is_empty() {
        return None;
    }
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "));
    let header_token = headers
        .get("x-metrics-token")
        .and_then(|value| value.to_str().ok());
    if bearer == Some(token.as_str()) || header_token == Some(token.as_str()) {
        None
    } else {
        Some(StatusCode::UNAUTHORIZED)
    }
}
