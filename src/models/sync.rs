//! Wire types of the stateless batch-sync protocol.
//!
//! The server keeps no session: everything a caller needs to resume lives
//! in the [`BatchCursor`] it sends with every request.

use serde::{Deserialize, Serialize};
use std::fmt;

pub const MIN_BATCH_SIZE: i64 = 1;
pub const MAX_BATCH_SIZE: i64 = 50;

/// Anchor used when a cursor carries none. Every record written to the
/// store counts as handled inside the session, so the selection never
/// shrinks and plain `{offset, batchSize, mode}` paging visits each
/// record once; records synced before the session come back as `info`.
pub const OPEN_ANCHOR: i64 = 0;

/// Candidate selection mode.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    /// Records without a remote primary copy.
    #[default]
    Full,
    /// Synced records with at least one secondary variant missing remotely.
    Incremental,
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncMode::Full => write!(f, "full"),
            SyncMode::Incremental => write!(f, "incremental"),
        }
    }
}

impl std::str::FromStr for SyncMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "full" => Ok(SyncMode::Full),
            "incremental" => Ok(SyncMode::Incremental),
            other => Err(format!("unknown sync mode `{}`", other)),
        }
    }
}

/// Position of a caller inside a multi-call sync session.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BatchCursor {
    #[serde(default)]
    pub offset: i64,
    pub batch_size: i64,
    #[serde(default)]
    pub mode: SyncMode,
    /// Unix millis of the session start. Records whose remote metadata was
    /// written at or after it keep their position in the selection, so
    /// `offset` stays meaningful while the pool shrinks. Absent means
    /// [`OPEN_ANCHOR`].
    #[serde(default)]
    pub anchor: Option<i64>,
}

impl BatchCursor {
    pub fn new(batch_size: i64, mode: SyncMode) -> Self {
        Self {
            offset: 0,
            batch_size,
            mode,
            anchor: None,
        }
    }

    /// Start a session at `anchor`: only records still pending or synced
    /// from `anchor` on are selected.
    pub fn with_anchor(self, anchor: i64) -> Self {
        Self {
            anchor: Some(anchor),
            ..self
        }
    }

    pub fn effective_anchor(&self) -> i64 {
        self.anchor.unwrap_or(OPEN_ANCHOR)
    }

    /// Clamp the caller-supplied values into the accepted range.
    pub fn normalized(self) -> Self {
        Self {
            offset: self.offset.max(0),
            batch_size: self.batch_size.clamp(MIN_BATCH_SIZE, MAX_BATCH_SIZE),
            ..self
        }
    }

    /// Cursor for the next call after `result`.
    pub fn advance(self, result: &BatchResult) -> Self {
        Self {
            offset: self.offset + result.processed_count,
            anchor: Some(result.anchor),
            ..self
        }
    }
}

/// `POST /sync/batch` request body.
#[derive(Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct BatchRequest {
    #[serde(flatten)]
    pub cursor: BatchCursor,
    #[serde(default)]
    pub regenerate_metadata: bool,
}

/// Classification of one processed record.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OutcomeKind {
    Success,
    /// Nothing to do (already synced, not an image, ...). Reported as `info`.
    #[serde(rename = "info")]
    Skipped,
    Warning,
    Error,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ItemOutcome {
    pub id: i64,
    pub kind: OutcomeKind,
    pub message: String,
}

impl ItemOutcome {
    pub fn new(id: i64, kind: OutcomeKind, message: impl Into<String>) -> Self {
        Self {
            id,
            kind,
            message: message.into(),
        }
    }
}

/// `POST /sync/batch` response body.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BatchResult {
    pub processed_count: i64,
    pub outcomes: Vec<ItemOutcome>,
    pub total_remaining: i64,
    pub total_candidates: i64,
    /// Anchor to echo back in the next cursor.
    pub anchor: i64,
    /// Set when a credential-level failure makes further batches pointless.
    pub halted: bool,
}

impl BatchResult {
    /// Fewer records than requested means the candidate pool is exhausted.
    pub fn is_exhausted(&self, cursor: &BatchCursor) -> bool {
        self.processed_count < cursor.batch_size
    }

    pub fn count(&self, kind: OutcomeKind) -> usize {
        self.outcomes.iter().filter(|o| o.kind == kind).count()
    }
}

/// `GET /sync/status` response body.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct SyncStatus {
    pub total: i64,
    pub synced: i64,
    pub remaining: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_accepts_wire_shape() {
        let req: BatchRequest = serde_json::from_str(
            r#"{"offset":20,"batchSize":80,"mode":"incremental","regenerateMetadata":true}"#,
        )
        .unwrap();
        assert_eq!(req.cursor.offset, 20);
        assert_eq!(req.cursor.mode, SyncMode::Incremental);
        assert!(req.regenerate_metadata);
        assert_eq!(req.cursor.anchor, None);
        assert_eq!(req.cursor.normalized().batch_size, MAX_BATCH_SIZE);
    }

    #[test]
    fn skipped_outcome_serializes_as_info() {
        let json = serde_json::to_value(ItemOutcome::new(1, OutcomeKind::Skipped, "x")).unwrap();
        assert_eq!(json["kind"], "info");
    }

    #[test]
    fn advance_moves_offset_and_keeps_anchor() {
        let cursor = BatchCursor::new(10, SyncMode::Full);
        let result = BatchResult {
            processed_count: 10,
            outcomes: vec![],
            total_remaining: 15,
            total_candidates: 25,
            anchor: 1_700_000_000_000,
            halted: false,
        };
        let next = cursor.advance(&result);
        assert_eq!(next.offset, 10);
        assert_eq!(next.anchor, Some(1_700_000_000_000));
        assert!(!result.is_exhausted(&cursor));
    }
}
