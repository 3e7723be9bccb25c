//! Defines every route of the offload service.
//!
//! ## Structure
//! - **Media records**
//!   - `POST   /media` - register (auto-offload when enabled)
//!   - `GET    /media/{id}` - record with its remote metadata
//!   - `DELETE /media/{id}` - deletion hook (remote copies first)
//!   - `POST   /media/{id}/offload` - upload all variants (`?force=true` re-uploads)
//!   - `POST   /media/{id}/variants/{variant}/upload` - single-variant upload
//!   - `GET    /media/{id}/url` - variant URL (`?variant=`)
//!   - `GET    /media/{id}/events` - activity journal
//!
//! - **Batch sync**
//!   - `POST   /sync/batch` - process one batch at the caller's cursor
//!   - `GET    /sync/status` - total / synced / remaining
//!
//! - **URL rewriting**
//!   - `POST   /rewrite/url`, `/rewrite/srcset`, `/rewrite/content`
//!
//! - **Store**
//!   - `POST   /connection/test` - HEAD the bucket root

use crate::{
    handlers::{
        health_handlers::{healthz, readyz},
        media_handlers::{
            create_media, delete_media, get_media, media_events, media_url, offload_media,
            test_connection, upload_variant,
        },
        rewrite_handlers::{rewrite_content, rewrite_srcset, rewrite_url},
        sync_handlers::{sync_batch, sync_status},
    },
    state::AppState,
};
use axum::{
    Router,
    routing::{get, post},
};

/// Build the router. State (`AppState`) is attached by the caller.
pub fn routes() -> Router<AppState> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        // Media records
        .route("/media", post(create_media))
        .route("/media/{id}", get(get_media).delete(delete_media))
        .route("/media/{id}/offload", post(offload_media))
        .route("/media/{id}/variants/{variant}/upload", post(upload_variant))
        .route("/media/{id}/url", get(media_url))
        .route("/media/{id}/events", get(media_events))
        // Batch sync
        .route("/sync/batch", post(sync_batch))
        .route("/sync/status", get(sync_status))
        // URL rewriting
        .route("/rewrite/url", post(rewrite_url))
        .route("/rewrite/srcset", post(rewrite_srcset))
        .route("/rewrite/content", post(rewrite_content))
        // Store
        .route("/connection/test", post(test_connection))
}
