//! Fetch → transform → dispatch for one subject.

use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use intim_adapters::{NoticeSink, NoticeSource};
use intim_core::{
    normalize_record, rolling_window, NormalizedRecord, TransformOptions, TriggerRequest,
};
use intim_storage::WatermarkStore;
use serde::Serialize;
use tracing::{info, info_span, Instrument};
use uuid::Uuid;

use crate::config::{DispatchConfig, FetchConfig};
use crate::dispatch::{DispatchPipeline, DispatchSummary};
use crate::fetch::{DateRangeFetcher, DayError};
use crate::watermark::WatermarkTracker;

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub subject_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub days_requested: usize,
    pub fetched_records: usize,
    pub day_errors: Vec<DayError>,
    pub dispatch: DispatchSummary,
}

pub struct SyncPipeline {
    fetcher: DateRangeFetcher,
    dispatcher: DispatchPipeline,
    transform: TransformOptions,
    lookback_days: u32,
}

impl SyncPipeline {
    pub fn new(
        source: Arc<dyn NoticeSource>,
        sink: Arc<dyn NoticeSink>,
        watermarks: Arc<dyn WatermarkStore>,
        lookback_days: u32,
    ) -> Self {
        Self::with_config(
            source,
            sink,
            watermarks,
            lookback_days,
            FetchConfig::default(),
            DispatchConfig::default(),
        )
    }

    pub fn with_config(
        source: Arc<dyn NoticeSource>,
        sink: Arc<dyn NoticeSink>,
        watermarks: Arc<dyn WatermarkStore>,
        lookback_days: u32,
        fetch: FetchConfig,
        dispatch: DispatchConfig,
    ) -> Self {
        Self {
            fetcher: DateRangeFetcher::new(source, fetch),
            dispatcher: DispatchPipeline::new(
                sink,
                Arc::new(WatermarkTracker::new(watermarks)),
                dispatch,
            ),
            transform: TransformOptions::default(),
            lookback_days,
        }
    }

    pub async fn run(&self, request: &TriggerRequest) -> SyncRunSummary {
        self.run_for_day(request, Utc::now().date_naive()).await
    }

    /// Run over the rolling window that ends the day before `today`.
    pub async fn run_for_day(&self, request: &TriggerRequest, today: NaiveDate) -> SyncRunSummary {
        let run_id = Uuid::new_v4();
        let span = info_span!(
            "sync_run",
            %run_id,
            subject_id = %request.subject_id(),
            subject_type = %request.subject_type()
        );
        self.run_inner(run_id, request, today).instrument(span).await
    }

    async fn run_inner(
        &self,
        run_id: Uuid,
        request: &TriggerRequest,
        today: NaiveDate,
    ) -> SyncRunSummary {
        let started_at = Utc::now();
        let days = rolling_window(today, self.lookback_days);
        info!(days = days.len(), "sync run started");

        let fetched = self.fetcher.fetch(request, &days).await;
        let records = fetched
            .records
            .iter()
            .map(|raw| normalize_record(raw, &self.transform))
            .collect::<Vec<NormalizedRecord>>();

        let credentials = request.credentials();
        let dispatch = self
            .dispatcher
            .dispatch(
                credentials.subject_id(),
                credentials.sink_target_id(),
                credentials.access_token(),
                &records,
            )
            .await;

        let summary = SyncRunSummary {
            run_id,
            subject_id: credentials.subject_id().to_string(),
            started_at,
            finished_at: Utc::now(),
            days_requested: days.len(),
            fetched_records: records.len(),
            day_errors: fetched.errors,
            dispatch,
        };
        info!(
            fetched = summary.fetched_records,
            failed_days = summary.day_errors.len(),
            dispatched = summary.dispatch.success,
            dispatch_errors = summary.dispatch.errors,
            "sync run finished"
        );
        summary
    }
}
