use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use intim_adapters::{
    HttpTrigger, LookupClient, NotionSink, NotionValidationStore, PipelineTrigger, TriggerError,
};
use intim_core::TriggerRequest;
use intim_storage::{SubjectRepository, WatermarkStore};

use crate::config::{SyncConfig, TriggerMode};
use crate::dedup::DedupCache;
use crate::pipeline::SyncPipeline;
use crate::reconcile::ReconciliationLoop;
use crate::registry::TaskRegistry;
use crate::trigger::LocalTrigger;

/// Process-wide state: built once at startup, shared by the web routes and the
/// reconciliation loop, drained by [`SyncState::shutdown`].
#[derive(Clone)]
pub struct SyncState {
    pipeline: Arc<SyncPipeline>,
    registry: TaskRegistry,
    dedup: Arc<DedupCache>,
    shutdown_grace: Duration,
}

impl SyncState {
    pub fn new(pipeline: Arc<SyncPipeline>, shutdown_grace: Duration) -> Self {
        Self {
            pipeline,
            registry: TaskRegistry::new(),
            dedup: Arc::new(DedupCache::new()),
            shutdown_grace,
        }
    }

    /// Wire the HTTP-backed lookup and sink clients from configuration.
    pub fn from_config(config: &SyncConfig, watermarks: Arc<dyn WatermarkStore>) -> Result<Self> {
        let source = LookupClient::new(
            config.lookup_base_url.clone(),
            &config.http_client(config.source_timeout),
        )?;
        let sink = NotionSink::new(
            config.sink_base_url.clone(),
            config.sink_api_version.clone(),
            &config.http_client(config.sink_timeout),
        )?;
        let pipeline = SyncPipeline::with_config(
            Arc::new(source),
            Arc::new(sink),
            watermarks,
            config.lookback_days,
            config.fetch,
            config.dispatch,
        );
        Ok(Self::new(Arc::new(pipeline), config.shutdown_grace))
    }

    pub fn pipeline(&self) -> &Arc<SyncPipeline> {
        &self.pipeline
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.registry
    }

    pub fn dedup(&self) -> &Arc<DedupCache> {
        &self.dedup
    }

    pub fn local_trigger(&self) -> LocalTrigger {
        LocalTrigger::new(self.pipeline.clone(), self.registry.clone())
    }

    /// Accept a run and return immediately; the outcome is only logged.
    pub fn spawn_run(&self, request: TriggerRequest) -> Result<(), TriggerError> {
        self.local_trigger().spawn(request)
    }

    /// Trigger for the reconciliation loop, per the configured mode.
    pub fn trigger_for(&self, config: &SyncConfig) -> Result<Arc<dyn PipelineTrigger>> {
        Ok(match config.trigger_mode {
            TriggerMode::Local => Arc::new(self.local_trigger()),
            TriggerMode::Http => Arc::new(HttpTrigger::new(
                config.trigger_url.clone(),
                &config.http_client(config.trigger_timeout),
            )?),
        })
    }

    pub fn reconciliation_loop(
        &self,
        config: &SyncConfig,
        repository: Arc<dyn SubjectRepository>,
        trigger: Arc<dyn PipelineTrigger>,
    ) -> Result<ReconciliationLoop> {
        let validation = NotionValidationStore::new(
            config.sink_base_url.clone(),
            config.sink_api_version.clone(),
            &config.http_client(config.validation_timeout),
        )?;
        Ok(ReconciliationLoop::new(
            repository,
            Arc::new(validation),
            trigger,
            self.dedup.clone(),
            config.reconcile,
        ))
    }

    /// Wait up to the grace period for detached runs. False if some were
    /// still running.
    pub async fn shutdown(&self) -> bool {
        self.registry.shutdown(self.shutdown_grace).await
    }
}
