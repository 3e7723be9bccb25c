//! Read-time URL rewriting for the host's renderer.

use crate::{errors::AppError, state::AppState};
use axum::{Json, extract::State};
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RewriteUrlReq {
    pub url: String,
    pub record_id: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RewriteSrcsetReq {
    pub srcset: String,
    pub record_id: i64,
}

#[derive(Debug, Deserialize)]
pub struct RewriteContentReq {
    pub content: String,
}

#[derive(Serialize)]
pub struct Rewritten {
    pub result: String,
}

/// `POST /rewrite/url`
pub async fn rewrite_url(
    State(state): State<AppState>,
    Json(req): Json<RewriteUrlReq>,
) -> Result<Json<Rewritten>, AppError> {
    let result = state.resolver.rewrite_reference_url(&req.url, req.record_id).await?;
    Ok(Json(Rewritten { result }))
}

/// `POST /rewrite/srcset`
pub async fn rewrite_srcset(
    State(state): State<AppState>,
    Json(req): Json<RewriteSrcsetReq>,
) -> Result<Json<Rewritten>, AppError> {
    let result = state.resolver.rewrite_srcset(&req.srcset, req.record_id).await?;
    Ok(Json(Rewritten { result }))
}

/// `POST /rewrite/content`
pub async fn rewrite_content(
    State(state): State<AppState>,
    Json(req): Json<RewriteContentReq>,
) -> Result<Json<Rewritten>, AppError> {
    let result = state.resolver.rewrite_content(&req.content).await?;
    Ok(Json(Rewritten { result }))
}
