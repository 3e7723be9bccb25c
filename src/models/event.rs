use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::FromRow;

/// Kinds of entries written to the activity journal.
pub const EVENT_UPLOAD: &str = "upload";
pub const EVENT_DELETE: &str = "delete";

/// One row of `offload_events`.
#[derive(Serialize, Clone, FromRow, Debug)]
#[serde(rename_all = "camelCase")]
pub struct OffloadEvent {
    pub id: i64,
    pub media_id: i64,
    pub kind: String,
    pub variant: Option<String>,
    pub remote_key: Option<String>,
    pub detail: String,
    pub recorded_at: DateTime<Utc>,
}
