//! Rolling-window fetch from the lookup service.

use std::sync::Arc;

use futures::stream::{self, StreamExt};
use intim_adapters::NoticeSource;
use intim_core::{DayDescriptor, RawRecord, TriggerRequest};
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::FetchConfig;

/// One failed day. `detail` is the lookup error text; for a non-success
/// status it is the bare status code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DayError {
    pub day: String,
    pub detail: String,
}

#[derive(Debug, Default)]
pub struct FetchOutcome {
    pub records: Vec<RawRecord>,
    pub errors: Vec<DayError>,
}

/// Split `days` into consecutive windows of `size`, keeping order. The last
/// window may be shorter.
pub fn group_into_windows(days: &[DayDescriptor], size: usize) -> Vec<Vec<DayDescriptor>> {
    days.chunks(size.max(1)).map(<[DayDescriptor]>::to_vec).collect()
}

pub struct DateRangeFetcher {
    source: Arc<dyn NoticeSource>,
    config: FetchConfig,
}

impl DateRangeFetcher {
    pub fn new(source: Arc<dyn NoticeSource>, config: FetchConfig) -> Self {
        Self { source, config }
    }

    pub async fn fetch(&self, request: &TriggerRequest, days: &[DayDescriptor]) -> FetchOutcome {
        let windows = group_into_windows(days, self.config.days_per_window);
        let per_window = stream::iter(windows)
            .map(|window| self.fetch_window(request, window))
            .buffer_unordered(self.config.max_windows_in_flight.max(1))
            .collect::<Vec<_>>()
            .await;

        let mut outcome = FetchOutcome::default();
        for window in per_window {
            outcome.records.extend(window.records);
            outcome.errors.extend(window.errors);
        }
        debug!(
            subject_id = %request.subject_id(),
            records = outcome.records.len(),
            failed_days = outcome.errors.len(),
            "date range fetched"
        );
        outcome
    }

    async fn fetch_window(
        &self,
        request: &TriggerRequest,
        window: Vec<DayDescriptor>,
    ) -> FetchOutcome {
        let mut outcome = FetchOutcome::default();
        for day in window {
            match self.source.fetch_day(request, day).await {
                Ok(records) => outcome.records.extend(records),
                Err(err) => {
                    warn!(
                        subject_id = %request.subject_id(),
                        %day,
                        error = %err,
                        "day fetch failed"
                    );
                    outcome.errors.push(DayError {
                        day: day.to_string(),
                        detail: err.to_string(),
                    });
                }
            }
        }
        outcome
    }
}
