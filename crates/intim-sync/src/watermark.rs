use std::sync::Arc;

use chrono::{DateTime, Utc};
use intim_storage::{KeyedLocks, WatermarkStore};
use tracing::{error, info};

/// Records the last treated timestamp per subject. Writes for one subject are
/// serialized; failures are logged and swallowed.
pub struct WatermarkTracker {
    store: Arc<dyn WatermarkStore>,
    locks: KeyedLocks,
}

impl WatermarkTracker {
    pub fn new(store: Arc<dyn WatermarkStore>) -> Self {
        Self {
            store,
            locks: KeyedLocks::new(),
        }
    }

    pub async fn record(&self, subject_id: &str, treated_at: DateTime<Utc>) {
        let _guard = self.locks.lock(subject_id).await;
        match self.store.upsert_watermark(subject_id, treated_at).await {
            Ok(()) => info!(%subject_id, %treated_at, "watermark updated"),
            Err(err) => error!(%subject_id, error = %err, "watermark update failed"),
        }
    }
}
