//! HTTP handlers for media records: ingest, manual offload, single-variant
//! upload, the deletion hook, the activity journal and the connection probe.

use crate::{
    errors::AppError,
    models::{
        event::OffloadEvent,
        media::{FULL_VARIANT, MediaRecord, NewMedia, RemoteMetadataMap, is_synced},
    },
    services::{
        ingest::IngestOutcome,
        object_store::{StoreError, UploadResult},
        offloader::{DeletionReport, VariantUploadReport},
        url_resolver::VariantUrl,
    },
    state::AppState,
};
use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

#[derive(Debug, Deserialize, Default)]
pub struct OffloadQuery {
    /// Re-upload variants that already have remote metadata.
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Deserialize)]
pub struct VariantQuery {
    pub variant: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaView {
    #[serde(flatten)]
    pub record: MediaRecord,
    pub synced: bool,
    pub remote: RemoteMetadataMap,
}

/// `POST /media`: register a record; auto-offloads when enabled.
pub async fn create_media(
    State(state): State<AppState>,
    Json(new): Json<NewMedia>,
) -> Result<(StatusCode, Json<IngestOutcome>), AppError> {
    let mut lifecycle = state.ingest.lifecycle();
    let outcome = state.ingest.ingest(new, &mut lifecycle).await?;

    if lifecycle.finish().is_some() {
        debug!(media_id = outcome.record.id, "variant uploads deferred past the response");
    }
    Ok((StatusCode::CREATED, Json(outcome)))
}

/// `GET /media/{id}`
pub async fn get_media(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<MediaView>, AppError> {
    let record = state.library.get(id).await?;
    let remote = state.library.remote_metadata(id).await?;
    Ok(Json(MediaView {
        record,
        synced: is_synced(&remote),
        remote,
    }))
}

/// `POST /media/{id}/offload[?force=true]`
pub async fn offload_media(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(query): Query<OffloadQuery>,
) -> Result<Json<VariantUploadReport>, AppError> {
    if !state.offloader.is_configured() {
        return Err(StoreError::NotConfigured.into());
    }
    let record = state.library.get(id).await?;
    let report = state
        .offloader
        .upload_all_variants(&record, &record.variant_paths(), query.force)
        .await?;
    Ok(Json(report))
}

/// `POST /media/{id}/variants/{variant}/upload`
pub async fn upload_variant(
    State(state): State<AppState>,
    Path((id, variant)): Path<(i64, String)>,
) -> Result<Json<UploadResult>, AppError> {
    let result = state.offloader.upload_variant(id, &variant).await?;
    Ok(Json(result))
}

/// `DELETE /media/{id}`: deletion hook for the host library.
pub async fn delete_media(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<DeletionReport>, AppError> {
    let report = state.offloader.delete_record(id).await?;
    Ok(Json(report))
}

/// `GET /media/{id}/events`
pub async fn media_events(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<Vec<OffloadEvent>>, AppError> {
    Ok(Json(state.journal.events(id).await?))
}

/// `GET /media/{id}/url[?variant=thumbnail]`
pub async fn media_url(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(query): Query<VariantQuery>,
) -> Result<Json<VariantUrl>, AppError> {
    let variant = query.variant.as_deref().unwrap_or(FULL_VARIANT);
    state
        .resolver
        .variant_url(id, variant)
        .await?
        .map(Json)
        .ok_or_else(|| AppError::not_found(format!("no URL for variant `{}` of media {}", variant, id)))
}

/// `POST /connection/test`
pub async fn test_connection(State(state): State<AppState>) -> Result<impl IntoResponse, AppError> {
    state.offloader.test_connection().await?;
    Ok(Json(json!({ "status": "ok" })))
}
