use axum::{
    body::Bytes,
    extract::{rejection::PathRejection, Path, State as AxumState},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use miam_types::api::{DrawRequest, LoginRequest, LoginResponse, SetDeadlineRequest, UpdateEmailRequest};
use miam_types::ParticipantId;
use std::sync::Arc;
use std::time::Instant;

use super::http::{decode_json, decode_json_or_default};
use crate::error::ApiError;
use crate::sessions::bearer_token;
use crate::Drawer;

fn require_admin(drawer: &Drawer, headers: &HeaderMap) -> Result<(), ApiError> {
    if !drawer.auth().enabled() {
        return Err(ApiError::AdminDisabled);
    }
    let token = bearer_token(headers).ok_or(ApiError::Unauthorized)?;
    drawer.auth().authorize(token, Drawer::now_ms())
}

pub(super) async fn login(
    AxumState(drawer): AxumState<Arc<Drawer>>,
    body: Bytes,
) -> Result<Json<LoginResponse>, ApiError> {
    let req: LoginRequest = decode_json(&body)?;
    let session = drawer.auth().login(req.password, Drawer::now_ms()).await;
    match session {
        Ok(session) => {
            tracing::info!("admin logged in");
            Ok(Json(LoginResponse {
                token: session.token,
                expires_at_ms: session.expires_at_ms,
            }))
        }
        Err(err) => {
            tracing::warn!(error = %err, "admin login rejected");
            Err(err)
        }
    }
}

pub(super) async fn logout(
    headers: HeaderMap,
    AxumState(drawer): AxumState<Arc<Drawer>>,
) -> Result<StatusCode, ApiError> {
    require_admin(&drawer, &headers)?;
    if let Some(token) = bearer_token(&headers) {
        drawer.auth().logout(token)?;
    }
    Ok(StatusCode::NO_CONTENT)
}

pub(super) async fn list_participants(
    headers: HeaderMap,
    AxumState(drawer): AxumState<Arc<Drawer>>,
) -> Result<Response, ApiError> {
    require_admin(&drawer, &headers)?;
    Ok(Json(drawer.participants().await).into_response())
}

pub(super) async fn remove_participant(
    headers: HeaderMap,
    AxumState(drawer): AxumState<Arc<Drawer>>,
    id: Result<Path<u64>, PathRejection>,
) -> Result<Response, ApiError> {
    require_admin(&drawer, &headers)?;
    let Path(id) = id?;
    let removed = drawer.remove_participant(ParticipantId(id)).await?;
    Ok(Json(removed).into_response())
}

pub(super) async fn update_email(
    headers: HeaderMap,
    AxumState(drawer): AxumState<Arc<Drawer>>,
    id: Result<Path<u64>, PathRejection>,
    body: Bytes,
) -> Result<Response, ApiError> {
    require_admin(&drawer, &headers)?;
    let Path(id) = id?;
    let req: UpdateEmailRequest = decode_json(&body)?;
    let updated = drawer.update_email(ParticipantId(id), &req.email).await?;
    Ok(Json(updated).into_response())
}

pub(super) async fn set_deadline(
    headers: HeaderMap,
    AxumState(drawer): AxumState<Arc<Drawer>>,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    require_admin(&drawer, &headers)?;
    let req: SetDeadlineRequest = decode_json(&body)?;
    drawer.set_deadline(req.deadline).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub(super) async fn clear_deadline(
    headers: HeaderMap,
    AxumState(drawer): AxumState<Arc<Drawer>>,
) -> Result<StatusCode, ApiError> {
    require_admin(&drawer, &headers)?;
    drawer.clear_deadline().await?;
    Ok(StatusCode::NO_CONTENT)
}

pub(super) async fn reset(
    headers: HeaderMap,
    AxumState(drawer): AxumState<Arc<Drawer>>,
) -> Result<StatusCode, ApiError> {
    require_admin(&drawer, &headers)?;
    drawer.reset().await?;
    Ok(StatusCode::NO_CONTENT)
}

pub(super) async fn draw(
    headers: HeaderMap,
    AxumState(drawer): AxumState<Arc<Drawer>>,
    body: Bytes,
) -> Result<Response, ApiError> {
    require_admin(&drawer, &headers)?;
    let DrawRequest { redraw } = decode_json_or_default(&body)?;
    let start = Instant::now();
    let result = drawer.draw(redraw).await;
    drawer.http_metrics().record_draw(start.elapsed());
    Ok(Json(result?).into_response())
}

pub(super) async fn assignments(
    headers: HeaderMap,
    AxumState(drawer): AxumState<Arc<Drawer>>,
) -> Result<Response, ApiError> {
    require_admin(&drawer, &headers)?;
    Ok(Json(drawer.assignments().await).into_response())
}

pub(super) async fn notify(
    headers: HeaderMap,
    AxumState(drawer): AxumState<Arc<Drawer>>,
) -> Result<Response, ApiError> {
    require_admin(&drawer, &headers)?;
    Ok(Json(drawer.notify_assignments().await).into_response())
}
