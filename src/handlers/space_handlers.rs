//! Space listing and quota endpoints.

use crate::{
    errors::AppError,
    handlers::auth::AuthUser,
    models::{
        permission::Permission,
        space::{Space, SpaceUsage},
    },
    services::engine::SpaceEngine,
};
use axum::{
    Json,
    extract::{Path, State},
};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

/// Body of `PATCH /spaces/{id}/quota`. `null` clears the quota.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaReq {
    pub quota_bytes: Option<i64>,
}

/// `GET /spaces`: spaces the caller can read.
pub async fn list_spaces(
    State(engine): State<SpaceEngine>,
    AuthUser(identity): AuthUser,
) -> Result<Json<Vec<Space>>, AppError> {
    Ok(Json(engine.spaces_for(&identity, Permission::Read).await?))
}

/// `GET /spaces-usage`
pub async fn spaces_usage(
    State(engine): State<SpaceEngine>,
    AuthUser(identity): AuthUser,
) -> Result<Json<Vec<SpaceUsage>>, AppError> {
    // Dropped with the request when the client goes away.
    let cancel = CancellationToken::new();
    let _guard = cancel.clone().drop_guard();
    Ok(Json(engine.usage_all(&identity, &cancel).await?))
}

/// `PATCH /spaces/{id}/quota`
pub async fn update_quota(
    State(engine): State<SpaceEngine>,
    AuthUser(identity): AuthUser,
    Path(space_id): Path<i64>,
    Json(req): Json<QuotaReq>,
) -> Result<Json<SpaceUsage>, AppError> {
    Ok(Json(
        engine.set_quota(&identity, space_id, req.quota_bytes).await?,
    ))
}
