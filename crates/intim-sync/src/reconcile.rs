//! Polls for subjects with an incomplete profile, completes them from their
//! validation store and triggers their first pipeline run.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use futures::FutureExt;
use intim_adapters::{PipelineTrigger, ValidationRow, ValidationSource};
use intim_core::{SubjectProfile, SubjectType, TriggerRequest};
use intim_storage::{PendingSubject, SubjectRepository};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::config::ReconcileConfig;
use crate::dedup::{DedupCache, TriggerOutcome};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubjectOutcome {
    /// Already triggered by this process.
    AlreadyTriggered,
    /// Validation did not pass; the subject is looked at again next iteration.
    Incomplete(String),
    /// Subject or its sync target vanished between query and update.
    NotFound,
    Triggered,
    TriggerFailed(String),
    /// The subject's task failed unexpectedly.
    Crashed(String),
}

#[derive(Debug, Default)]
pub struct IterationReport {
    pub considered: usize,
    pub outcomes: Vec<(String, SubjectOutcome)>,
}

impl IterationReport {
    pub fn triggered(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|(_, o)| {
                matches!(o, SubjectOutcome::Triggered | SubjectOutcome::TriggerFailed(_))
            })
            .count()
    }
}

/// Every row must carry a registration key and a known type, and company rows
/// an organization code. The profile comes from the first row.
pub fn validate_rows(rows: &[ValidationRow]) -> Result<SubjectProfile, String> {
    if rows.is_empty() {
        return Err("validation store has no rows".to_string());
    }
    let mut profiles = Vec::with_capacity(rows.len());
    for row in rows {
        let kind = row
            .subject_type
            .as_deref()
            .ok_or_else(|| format!("row {} has no type", row.id))?
            .parse::<SubjectType>()
            .map_err(|e| format!("row {}: {e}", row.id))?;
        let profile = SubjectProfile::new(
            row.registration_key.clone().unwrap_or_default(),
            row.organization_code.clone(),
            kind,
        )
        .map_err(|e| format!("row {}: {e}", row.id))?;
        profiles.push(profile);
    }
    Ok(profiles.swap_remove(0))
}

pub struct ReconciliationLoop {
    repository: Arc<dyn SubjectRepository>,
    validation: Arc<dyn ValidationSource>,
    trigger: Arc<dyn PipelineTrigger>,
    dedup: Arc<DedupCache>,
    config: ReconcileConfig,
}

impl ReconciliationLoop {
    pub fn new(
        repository: Arc<dyn SubjectRepository>,
        validation: Arc<dyn ValidationSource>,
        trigger: Arc<dyn PipelineTrigger>,
        dedup: Arc<DedupCache>,
        config: ReconcileConfig,
    ) -> Self {
        Self {
            repository,
            validation,
            trigger,
            dedup,
            config,
        }
    }

    /// Iterate until `cancel` fires. An in-progress iteration is finished
    /// first; the sleep between iterations is interrupted.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(
            poll_interval = ?self.config.poll_interval,
            concurrency = self.config.concurrency,
            "reconciliation loop started"
        );
        loop {
            if cancel.is_cancelled() {
                break;
            }
            let report = self.run_iteration().await;
            if report.considered > 0 {
                info!(
                    considered = report.considered,
                    triggered = report.triggered(),
                    "reconciliation iteration finished"
                );
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }
        info!("reconciliation loop stopped");
    }

    pub async fn run_iteration(&self) -> IterationReport {
        let pending = match self.repository.find_incomplete().await {
            Ok(pending) => pending,
            Err(err) => {
                error!(error = %err, "incomplete subject query failed");
                return IterationReport::default();
            }
        };
        let pending = pending
            .into_iter()
            .filter(|p| !self.dedup.contains(&p.subject_id))
            .collect::<Vec<_>>();

        let considered = pending.len();
        let outcomes = stream::iter(pending)
            .map(|subject| async move {
                let id = subject.subject_id.clone();
                let span = info_span!("reconcile_subject", subject_id = %id);
                let outcome = AssertUnwindSafe(self.process_subject(&subject).instrument(span))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|panic| {
                        let reason = panic_message(panic.as_ref());
                        error!(subject_id = %id, reason = %reason, "subject processing panicked");
                        SubjectOutcome::Crashed(reason)
                    });
                (id, outcome)
            })
            .buffer_unordered(self.config.concurrency.max(1))
            .collect::<Vec<_>>()
            .await;

        IterationReport {
            considered,
            outcomes,
        }
    }

    pub async fn process_subject(&self, subject: &PendingSubject) -> SubjectOutcome {
        if self.dedup.contains(&subject.subject_id) {
            return SubjectOutcome::AlreadyTriggered;
        }

        let rows = match self
            .validation
            .query_rows(&subject.validation_database_id, &subject.access_token)
            .await
        {
            Ok(rows) => rows,
            Err(err) => {
                warn!(error = %err, "validation store query failed");
                return SubjectOutcome::Incomplete(err.to_string());
            }
        };

        let profile = match validate_rows(&rows) {
            Ok(profile) => profile,
            Err(reason) => {
                debug!(%reason, "profile still incomplete");
                return SubjectOutcome::Incomplete(reason);
            }
        };

        // Built before the profile is committed: a committed subject leaves the
        // incomplete query and would never be picked up again.
        let request = match TriggerRequest::from_profile(
            &subject.subject_id,
            &subject.access_token,
            &subject.sink_database_id,
            &profile,
        ) {
            Ok(request) => request,
            Err(err) => {
                error!(error = %err, "cannot build trigger request");
                return SubjectOutcome::Incomplete(err.to_string());
            }
        };

        match self
            .repository
            .complete_profile(&subject.subject_id, &profile)
            .await
        {
            Ok(Some(_)) => {}
            Ok(None) => {
                warn!("subject or sync target not found");
                return SubjectOutcome::NotFound;
            }
            Err(err) => {
                error!(error = %err, "profile update failed");
                return SubjectOutcome::Incomplete(err.to_string());
            }
        }

        match self.trigger.trigger(request).await {
            Ok(()) => {
                info!(
                    subject_type = %profile.subject_type(),
                    "profile completed, pipeline triggered"
                );
                self.dedup.mark(&subject.subject_id, TriggerOutcome::Accepted);
                SubjectOutcome::Triggered
            }
            Err(err) => {
                // Marked anyway: the subject is not retried by this process.
                warn!(error = %err, "pipeline trigger failed, subject will not be retried");
                self.dedup
                    .mark(&subject.subject_id, TriggerOutcome::Failed(err.to_string()));
                SubjectOutcome::TriggerFailed(err.to_string())
            }
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
