//! Sync pipeline orchestration: date-range fetch, dispatch with retries,
//! watermarks, and the reconciliation loop that triggers first runs.

use std::sync::Arc;

use anyhow::{Context, Result};
use intim_core::{SubjectProfile, TriggerRequest};
use intim_storage::PgStore;

pub mod config;
pub mod dedup;
pub mod dispatch;
pub mod fetch;
pub mod pipeline;
pub mod reconcile;
pub mod registry;
pub mod state;
pub mod trigger;
pub mod watermark;

#[cfg(test)]
mod testing;

pub use config::{DispatchConfig, FetchConfig, ReconcileConfig, SyncConfig, TriggerMode};
pub use dedup::{DedupCache, TriggerOutcome};
pub use dispatch::{DispatchPipeline, DispatchResult, DispatchSummary};
pub use fetch::{group_into_windows, DateRangeFetcher, DayError, FetchOutcome};
pub use pipeline::{SyncPipeline, SyncRunSummary};
pub use reconcile::{validate_rows, IterationReport, ReconciliationLoop, SubjectOutcome};
pub use registry::TaskRegistry;
pub use state::SyncState;
pub use trigger::LocalTrigger;
pub use watermark::WatermarkTracker;

pub const CRATE_NAME: &str = "intim-sync";

/// One synchronous pipeline run for a stored subject whose profile is complete.
pub async fn run_subject_once_from_env(subject_id: &str) -> Result<SyncRunSummary> {
    let config = SyncConfig::from_env();
    let store = PgStore::connect(&config.database_url)
        .await
        .context("connecting to database")?;
    let (subject, target) = store
        .load_subject(subject_id)
        .await?
        .with_context(|| format!("subject {subject_id} not found"))?;
    let target = target.with_context(|| format!("subject {subject_id} has no sync target"))?;

    let subject_type = subject
        .subject_type
        .with_context(|| format!("subject {subject_id} has no type yet"))?;
    let profile = SubjectProfile::new(
        subject.registration_key.clone().unwrap_or_default(),
        subject.organization_code.clone(),
        subject_type,
    )
    .with_context(|| format!("subject {subject_id} profile is incomplete"))?;
    let request = TriggerRequest::from_profile(
        &subject.id,
        &subject.access_token,
        &target.sink_database_id,
        &profile,
    )?;

    let state = SyncState::from_config(&config, Arc::new(store))?;
    Ok(state.pipeline().run(&request).await)
}
