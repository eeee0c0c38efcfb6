use std::sync::Arc;

use async_trait::async_trait;
use intim_adapters::{PipelineTrigger, TriggerError};
use intim_core::TriggerRequest;
use tracing::info;

use crate::pipeline::SyncPipeline;
use crate::registry::TaskRegistry;

/// In-process trigger: spawns the run into the task registry and returns as
/// soon as it is scheduled.
#[derive(Clone)]
pub struct LocalTrigger {
    pipeline: Arc<SyncPipeline>,
    registry: TaskRegistry,
}

impl LocalTrigger {
    pub fn new(pipeline: Arc<SyncPipeline>, registry: TaskRegistry) -> Self {
        Self { pipeline, registry }
    }

    pub fn spawn(&self, request: TriggerRequest) -> Result<(), TriggerError> {
        if self.registry.is_closed() {
            return Err(TriggerError::Unavailable("shutting down".into()));
        }
        info!(
            subject_id = %request.subject_id(),
            subject_type = %request.subject_type(),
            "pipeline run accepted"
        );
        let pipeline = self.pipeline.clone();
        self.registry.spawn(async move {
            pipeline.run(&request).await;
        });
        Ok(())
    }
}

#[async_trait]
impl PipelineTrigger for LocalTrigger {
    async fn trigger(&self, request: TriggerRequest) -> Result<(), TriggerError> {
        self.spawn(request)
    }
}
