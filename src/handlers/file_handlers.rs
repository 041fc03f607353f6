//! HTTP handlers for browsing, transfers, uploads, trash and downloads.
//! Bodies are streamed in both directions; all storage concerns are
//! delegated to `SpaceEngine`.

use crate::{
    errors::AppError,
    handlers::auth::AuthUser,
    models::{
        permission::Identity,
        space::Space,
        ticket::DownloadTicket,
        transfer::{ConflictPolicy, Destination, FileEntry, ItemResult, TransferOutcome},
        trash::TrashItem,
    },
    services::{
        archive::DownloadArtifact,
        engine::SpaceEngine,
        error::EngineError,
        sandbox,
        transfer::UploadBegin,
    },
};
use axum::{
    Json,
    body::Body,
    extract::{Multipart, Path, Query, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::fs::File;
use tokio_util::{io::ReaderStream, sync::CancellationToken};
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Deserialize)]
pub struct PathQuery {
    #[serde(default)]
    pub path: String,
}

#[derive(Debug, Deserialize)]
pub struct SearchQuery {
    #[serde(default)]
    pub path: String,
    pub q: String,
}

#[derive(Debug, Deserialize)]
pub struct PathReq {
    pub path: String,
}

#[derive(Debug, Deserialize)]
pub struct PathsReq {
    pub paths: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenameReq {
    pub path: String,
    pub new_name: String,
    #[serde(default)]
    pub conflict_policy: ConflictPolicy,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferReq {
    pub sources: Vec<String>,
    pub destination: Destination,
    #[serde(default)]
    pub conflict_policy: ConflictPolicy,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreReq {
    pub ids: Vec<Uuid>,
    #[serde(default)]
    pub conflict_policy: ConflictPolicy,
}

#[derive(Debug, Deserialize)]
pub struct IdsReq {
    pub ids: Vec<Uuid>,
}

/// Either `{path}` or `{paths}`.
#[derive(Debug, Deserialize)]
pub struct TicketReq {
    pub path: Option<String>,
    pub paths: Option<Vec<String>>,
}

/// Subtracted from a multipart `Content-Length` to estimate the file payload.
/// Covers boundaries, part headers and the short text fields.
pub const MULTIPART_FRAMING_ALLOWANCE: u64 = 1024;

#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub status: &'static str,
    pub filename: String,
}

async fn space(engine: &SpaceEngine, identity: &Identity, id: i64) -> Result<Space, AppError> {
    Ok(engine.space_by_id(identity, id).await?)
}

/// `GET /spaces/{id}/browse?path=`
pub async fn browse(
    State(engine): State<SpaceEngine>,
    AuthUser(identity): AuthUser,
    Path(space_id): Path<i64>,
    Query(query): Query<PathQuery>,
) -> Result<Json<Vec<FileEntry>>, AppError> {
    let space = space(&engine, &identity, space_id).await?;
    Ok(Json(engine.list(&identity, &space, &query.path).await?))
}

/// `GET /spaces/{id}/search?path=&q=`
pub async fn search(
    State(engine): State<SpaceEngine>,
    AuthUser(identity): AuthUser,
    Path(space_id): Path<i64>,
    Query(query): Query<SearchQuery>,
) -> Result<Json<Vec<FileEntry>>, AppError> {
    let space = space(&engine, &identity, space_id).await?;
    let cancel = CancellationToken::new();
    let _guard = cancel.clone().drop_guard();
    Ok(Json(
        engine
            .search(&identity, &space, &query.path, &query.q, &cancel)
            .await?,
    ))
}

/// `POST /spaces/{id}/files/mkdir`
pub async fn mkdir(
    State(engine): State<SpaceEngine>,
    AuthUser(identity): AuthUser,
    Path(space_id): Path<i64>,
    Json(req): Json<PathReq>,
) -> Result<(StatusCode, Json<FileEntry>), AppError> {
    let space = space(&engine, &identity, space_id).await?;
    let entry = engine.mkdir(&identity, &space, &req.path).await?;
    Ok((StatusCode::CREATED, Json(entry)))
}

/// `POST /spaces/{id}/files/upload` (multipart).
///
/// Text fields (`path`, `conflictPolicy`, legacy `overwrite`) must precede
/// the `file` part; fields after it are never read. The quota estimate is the
/// request `Content-Length` minus [`MULTIPART_FRAMING_ALLOWANCE`], and the
/// upload slot enforces the quota on the bytes actually written.
pub async fn upload(
    State(engine): State<SpaceEngine>,
    AuthUser(identity): AuthUser,
    Path(space_id): Path<i64>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, AppError> {
    let space = space(&engine, &identity, space_id).await?;
    let size_hint = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .map(|len| len.saturating_sub(MULTIPART_FRAMING_ALLOWANCE));

    let mut dir = String::from("/");
    let mut policy_field: Option<String> = None;
    let mut overwrite_field: Option<String> = None;

    while let Some(mut field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::bad_request(e.to_string()))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "path" => dir = field.text().await.map_err(|e| AppError::bad_request(e.to_string()))?,
            "conflictPolicy" => {
                policy_field = Some(field.text().await.map_err(|e| AppError::bad_request(e.to_string()))?)
            }
            "overwrite" => {
                overwrite_field = Some(field.text().await.map_err(|e| AppError::bad_request(e.to_string()))?)
            }
            "file" => {
                let filename = field
                    .file_name()
                    .map(str::to_string)
                    .ok_or_else(|| AppError::bad_request("file part has no filename"))?;
                sandbox::validate_name(&filename).map_err(|e| AppError::bad_request(e.to_string()))?;
                let policy = ConflictPolicy::from_form(policy_field.as_deref(), overwrite_field.as_deref())
                    .map_err(AppError::bad_request)?;
                let target = format!("{}/{}", dir.trim_end_matches('/'), filename);

                let mut slot = match engine
                    .open_write(&identity, &space, &target, policy, size_hint)
                    .await?
                {
                    UploadBegin::Skipped(name) => {
                        return Ok(Json(UploadResponse {
                            status: "skipped",
                            filename: name,
                        }));
                    }
                    UploadBegin::Ready(slot) => slot,
                };

                loop {
                    match field.chunk().await {
                        Ok(Some(chunk)) => {
                            if let Err(err) = slot.write(&chunk).await {
                                slot.abort().await;
                                return Err(err.into());
                            }
                        }
                        Ok(None) => break,
                        Err(err) => {
                            warn!(space_id, path = %target, "upload stream failed: {}", err);
                            slot.abort().await;
                            return Err(AppError::bad_request(err.to_string()));
                        }
                    }
                }
                let filename = slot.commit().await?;
                return Ok(Json(UploadResponse {
                    status: "uploaded",
                    filename,
                }));
            }
            other => debug!("ignoring multipart field `{}`", other),
        }
    }

    Err(AppError::bad_request("missing `file` part"))
}

/// `POST /spaces/{id}/files/rename`
pub async fn rename(
    State(engine): State<SpaceEngine>,
    AuthUser(identity): AuthUser,
    Path(space_id): Path<i64>,
    Json(req): Json<RenameReq>,
) -> Result<Json<serde_json::Value>, AppError> {
    let space = space(&engine, &identity, space_id).await?;
    let result = engine
        .rename(&identity, &space, &req.path, &req.new_name, req.conflict_policy)
        .await?;
    Ok(Json(match result {
        ItemResult::Done(path) => json!({ "status": "renamed", "path": path }),
        ItemResult::Skipped => json!({ "status": "skipped", "path": sandbox::normalize_relative(&req.path) }),
    }))
}

/// `POST /spaces/{id}/files/move`
pub async fn move_items(
    State(engine): State<SpaceEngine>,
    AuthUser(identity): AuthUser,
    Path(space_id): Path<i64>,
    Json(req): Json<TransferReq>,
) -> Result<Json<TransferOutcome>, AppError> {
    let src = space(&engine, &identity, space_id).await?;
    let dest = space(&engine, &identity, req.destination.space_id).await?;
    Ok(Json(
        engine
            .move_items(&identity, &src, &req.sources, &dest, &req.destination.path, req.conflict_policy)
            .await?,
    ))
}

/// `POST /spaces/{id}/files/copy`
pub async fn copy_items(
    State(engine): State<SpaceEngine>,
    AuthUser(identity): AuthUser,
    Path(space_id): Path<i64>,
    Json(req): Json<TransferReq>,
) -> Result<Json<TransferOutcome>, AppError> {
    let src = space(&engine, &identity, space_id).await?;
    let dest = space(&engine, &identity, req.destination.space_id).await?;
    Ok(Json(
        engine
            .copy_items(&identity, &src, &req.sources, &dest, &req.destination.path, req.conflict_policy)
            .await?,
    ))
}

/// `POST /spaces/{id}/files/delete`: moves one item to the trash.
pub async fn delete(
    State(engine): State<SpaceEngine>,
    AuthUser(identity): AuthUser,
    Path(space_id): Path<i64>,
    Json(req): Json<PathReq>,
) -> Result<Json<TransferOutcome>, AppError> {
    let space = space(&engine, &identity, space_id).await?;
    Ok(Json(engine.delete(&identity, &space, &[req.path]).await?))
}

/// `POST /spaces/{id}/files/delete-multiple`
pub async fn delete_multiple(
    State(engine): State<SpaceEngine>,
    AuthUser(identity): AuthUser,
    Path(space_id): Path<i64>,
    Json(req): Json<PathsReq>,
) -> Result<Json<TransferOutcome>, AppError> {
    let space = space(&engine, &identity, space_id).await?;
    Ok(Json(engine.delete(&identity, &space, &req.paths).await?))
}

/// `GET /spaces/{id}/files/trash`
pub async fn list_trash(
    State(engine): State<SpaceEngine>,
    AuthUser(identity): AuthUser,
    Path(space_id): Path<i64>,
) -> Result<Json<Vec<TrashItem>>, AppError> {
    let space = space(&engine, &identity, space_id).await?;
    Ok(Json(engine.trash_list(&identity, &space).await?))
}

/// `POST /spaces/{id}/files/trash-restore`
pub async fn restore_trash(
    State(engine): State<SpaceEngine>,
    AuthUser(identity): AuthUser,
    Path(space_id): Path<i64>,
    Json(req): Json<RestoreReq>,
) -> Result<Json<TransferOutcome>, AppError> {
    let space = space(&engine, &identity, space_id).await?;
    Ok(Json(
        engine
            .trash_restore(&identity, &space, &req.ids, req.conflict_policy)
            .await?,
    ))
}

/// `POST /spaces/{id}/files/trash-delete`
pub async fn purge_trash(
    State(engine): State<SpaceEngine>,
    AuthUser(identity): AuthUser,
    Path(space_id): Path<i64>,
    Json(req): Json<IdsReq>,
) -> Result<Json<TransferOutcome>, AppError> {
    let space = space(&engine, &identity, space_id).await?;
    Ok(Json(engine.trash_purge(&identity, &space, &req.ids).await?))
}

/// `POST /spaces/{id}/files/trash-empty`
pub async fn empty_trash(
    State(engine): State<SpaceEngine>,
    AuthUser(identity): AuthUser,
    Path(space_id): Path<i64>,
) -> Result<Json<serde_json::Value>, AppError> {
    let space = space(&engine, &identity, space_id).await?;
    let removed = engine.trash_empty(&identity, &space).await?;
    Ok(Json(json!({ "removed": removed })))
}

/// `GET /spaces/{id}/files/download?path=`: the file itself, or a zip for a folder.
pub async fn download(
    State(engine): State<SpaceEngine>,
    AuthUser(identity): AuthUser,
    Path(space_id): Path<i64>,
    Query(query): Query<PathQuery>,
) -> Result<Response, AppError> {
    let space = space(&engine, &identity, space_id).await?;
    let artifact = engine
        .prepare_download(&identity, &space, &[query.path])
        .await?;
    stream_artifact(artifact).await
}

/// `POST /spaces/{id}/files/download-multiple`: a zip unless only one file is named.
pub async fn download_multiple(
    State(engine): State<SpaceEngine>,
    AuthUser(identity): AuthUser,
    Path(space_id): Path<i64>,
    Json(req): Json<PathsReq>,
) -> Result<Response, AppError> {
    let space = space(&engine, &identity, space_id).await?;
    let artifact = engine.prepare_download(&identity, &space, &req.paths).await?;
    stream_artifact(artifact).await
}

/// `POST /spaces/{id}/files/download-ticket`
pub async fn download_ticket(
    State(engine): State<SpaceEngine>,
    AuthUser(identity): AuthUser,
    Path(space_id): Path<i64>,
    Json(req): Json<TicketReq>,
) -> Result<Json<DownloadTicket>, AppError> {
    let paths = match (req.path, req.paths) {
        (_, Some(paths)) if !paths.is_empty() => paths,
        (Some(path), _) => vec![path],
        _ => return Err(AppError::bad_request("`path` or `paths` is required")),
    };
    let space = space(&engine, &identity, space_id).await?;
    Ok(Json(engine.issue_ticket(&identity, &space, &paths).await?))
}

/// `GET /downloads/{token}`: redeem a ticket issued to the caller.
pub async fn redeem_ticket(
    State(engine): State<SpaceEngine>,
    AuthUser(identity): AuthUser,
    Path(token): Path<String>,
) -> Result<Response, AppError> {
    let ticket = engine.redeem_ticket(&identity, &token).await?;
    stream_artifact(DownloadArtifact {
        path: ticket.file_path,
        file_name: ticket.file_name,
        content_type: ticket.content_type,
        size: ticket.content_size,
        temporary: ticket.remove_after_use,
    })
    .await
}

async fn stream_artifact(artifact: DownloadArtifact) -> Result<Response, AppError> {
    let file = File::open(&artifact.path)
        .await
        .map_err(EngineError::from)?;
    if artifact.temporary {
        // The open handle keeps the content readable until the stream ends.
        if let Err(err) = tokio::fs::remove_file(&artifact.path).await {
            warn!("failed to remove download artifact {}: {}", artifact.path.display(), err);
        }
    }

    let mut response = Response::new(Body::from_stream(ReaderStream::new(file)));
    *response.status_mut() = StatusCode::OK;
    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&artifact.content_type) {
        headers.insert(header::CONTENT_TYPE, value);
    }
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(artifact.size));
    if let Ok(value) = HeaderValue::from_str(&content_disposition(&artifact.file_name)) {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }
    Ok(response.into_response())
}

fn content_disposition(file_name: &str) -> String {
    let ascii: String = file_name
        .chars()
        .map(|c| if c.is_ascii_graphic() || c == ' ' { c } else { '_' })
        .filter(|c| *c != '"' && *c != '\\')
        .collect();
    format!("attachment; filename=\"{}\"", ascii)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disposition_strips_quotes_and_non_ascii() {
        assert_eq!(
            content_disposition("r\"é sumé.pdf"),
            "attachment; filename=\"r_ sum_.pdf\""
        );
    }
}
