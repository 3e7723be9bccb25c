//! Caller-side session state: the progress tracker and the polling loop
//! that drives batches until the pool is exhausted, the engine halts, or
//! the operator cancels.

use crate::{
    models::sync::{BatchCursor, BatchRequest, BatchResult, OutcomeKind},
    services::batch_engine::{BatchEngine, SyncError},
};
use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub const MIN_BATCH_DELAY: Duration = Duration::from_millis(100);
pub const MAX_BATCH_DELAY: Duration = Duration::from_millis(5000);

/// Counts accumulated over one sync session.
#[derive(Serialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProgressTracker {
    pub batches: u32,
    pub processed: i64,
    pub success: i64,
    pub errors: i64,
    pub warnings: i64,
    pub skipped: i64,
    pub total_candidates: i64,
    pub total_remaining: i64,
}

impl ProgressTracker {
    pub fn record(&mut self, result: &BatchResult) {
        self.batches += 1;
        self.processed += result.processed_count;
        self.success += result.count(OutcomeKind::Success) as i64;
        self.errors += result.count(OutcomeKind::Error) as i64;
        self.warnings += result.count(OutcomeKind::Warning) as i64;
        self.skipped += result.count(OutcomeKind::Skipped) as i64;
        self.total_candidates = result.total_candidates;
        self.total_remaining = result.total_remaining;
    }

    /// Share of the session's candidates processed so far, 0..=100.
    pub fn percentage(&self) -> f64 {
        let total = self.processed + self.total_remaining;
        if total <= 0 {
            return 100.0;
        }
        (self.processed as f64 / total as f64 * 100.0).clamp(0.0, 100.0)
    }
}

/// Terminal state of a session. A session is running for as long as
/// [`SyncRunner::run`] has not returned.
#[derive(Serialize, Clone, Debug, PartialEq)]
#[serde(tag = "state", content = "reason", rename_all = "lowercase")]
pub enum RunState {
    Completed,
    Stopped,
    Errored(String),
}

/// What a runner drives. Implemented by the engine; tests script it.
#[async_trait]
pub trait BatchExecutor: Send + Sync {
    async fn execute(&self, request: BatchRequest) -> Result<BatchResult, SyncError>;
}

#[async_trait]
impl BatchExecutor for BatchEngine {
    async fn execute(&self, request: BatchRequest) -> Result<BatchResult, SyncError> {
        self.run_batch(request).await
    }
}

#[derive(Debug, Clone)]
pub struct SyncReport {
    pub state: RunState,
    pub progress: ProgressTracker,
    /// Cursor the next batch would have used.
    pub cursor: BatchCursor,
}

pub struct SyncRunner<E> {
    executor: E,
    delay: Duration,
    cancel: CancellationToken,
}

impl<E: BatchExecutor> SyncRunner<E> {
    pub fn new(executor: E, delay: Duration, cancel: CancellationToken) -> Self {
        Self {
            executor,
            delay: delay.clamp(MIN_BATCH_DELAY, MAX_BATCH_DELAY),
            cancel,
        }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Issue batches from `cursor` until a terminal state. A batch in
    /// flight is never interrupted; cancellation is observed between
    /// batches.
    pub async fn run(
        &self,
        mut cursor: BatchCursor,
        regenerate_metadata: bool,
        mut on_batch: impl FnMut(&ProgressTracker, &BatchResult) + Send,
    ) -> SyncReport {
        let mut progress = ProgressTracker::default();
        cursor = cursor.normalized();

        let state = loop {
            if self.cancel.is_cancelled() {
                break RunState::Stopped;
            }

            let request = BatchRequest {
                cursor,
                regenerate_metadata,
            };
            let result = match self.executor.execute(request).await {
                Ok(result) => result,
                Err(err) => {
                    warn!(offset = cursor.offset, "sync batch failed: {}", err);
                    break RunState::Errored(err.to_string());
                }
            };

            progress.record(&result);
            on_batch(&progress, &result);

            if result.halted {
                break RunState::Errored("credential-level failure, sync halted".into());
            }
            if result.is_exhausted(&cursor) {
                cursor = cursor.advance(&result);
                break RunState::Completed;
            }
            cursor = cursor.advance(&result);

            tokio::select! {
                _ = self.cancel.cancelled() => break RunState::Stopped,
                _ = tokio::time::sleep(self.delay) => {}
            }
        };

        info!(
            state = ?state,
            batches = progress.batches,
            processed = progress.processed,
            success = progress.success,
            errors = progress.errors,
            "sync session finished"
        );

        SyncReport {
            state,
            progress,
            cursor,
        }
    }
}
