//! Bounded-concurrency delivery of normalized records to the sink.

use std::sync::Arc;

use futures::stream::{self, StreamExt};
use intim_adapters::{NoticeSink, SinkError};
use intim_core::NormalizedRecord;
use intim_storage::RetryDisposition;
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::DispatchConfig;
use crate::watermark::WatermarkTracker;

/// Per-record outcome. `index` is the 0-based position in the batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DispatchResult {
    pub index: usize,
    pub success: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DispatchSummary {
    pub success: usize,
    pub errors: usize,
    pub details: Vec<DispatchResult>,
}

pub struct DispatchPipeline {
    sink: Arc<dyn NoticeSink>,
    watermarks: Arc<WatermarkTracker>,
    config: DispatchConfig,
}

impl DispatchPipeline {
    pub fn new(
        sink: Arc<dyn NoticeSink>,
        watermarks: Arc<WatermarkTracker>,
        config: DispatchConfig,
    ) -> Self {
        Self {
            sink,
            watermarks,
            config,
        }
    }

    /// Send every record and wait until all have settled. Never stops early.
    pub async fn dispatch(
        &self,
        subject_id: &str,
        target_id: &str,
        access_token: &str,
        records: &[NormalizedRecord],
    ) -> DispatchSummary {
        let sends: Vec<_> = records
            .iter()
            .enumerate()
            .map(|(index, record)| async move {
                match self.send_with_retry(target_id, access_token, record).await {
                    Ok(()) => DispatchResult {
                        index,
                        success: true,
                        error: None,
                    },
                    Err(err) => {
                        warn!(%subject_id, index, error = %err, "record dispatch failed");
                        DispatchResult {
                            index,
                            success: false,
                            error: Some(err.to_string()),
                        }
                    }
                }
            })
            .collect();
        let mut details = stream::iter(sends)
            .buffer_unordered(self.config.max_in_flight.max(1))
            .collect::<Vec<_>>()
            .await;
        details.sort_by_key(|d| d.index);

        let success = details.iter().filter(|d| d.success).count();
        let summary = DispatchSummary {
            success,
            errors: details.len() - success,
            details,
        };

        if summary.success > 0 {
            // Batch maximum over every source record, not only the delivered ones.
            if let Some(latest) = records.iter().filter_map(|r| r.treated_at).max() {
                self.watermarks.record(subject_id, latest).await;
            }
        }
        debug!(%subject_id, success = summary.success, errors = summary.errors, "batch dispatched");
        summary
    }

    async fn send_with_retry(
        &self,
        target_id: &str,
        access_token: &str,
        record: &NormalizedRecord,
    ) -> Result<(), SinkError> {
        let policy = self.config.backoff;
        let mut attempt = 0usize;
        loop {
            attempt += 1;
            match self.sink.create_page(target_id, access_token, record).await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    let retryable = err.disposition() == RetryDisposition::Retryable;
                    if !retryable || attempt >= policy.max_attempts() {
                        return Err(err);
                    }
                    let delay = policy.jittered_delay(attempt - 1);
                    debug!(attempt, ?delay, error = %err, "retrying sink dispatch");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
