//! Liveness pipeline.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use super::queues;
use crate::error::Result;
use crate::orchestrator::{Orchestrator, Pipeline, Unit};
use crate::substrate::{async_handler, PipelineStage, Registration};

pub const PONG_STAGE: &str = "pong";

fn pong_stage() -> PipelineStage {
    PipelineStage::new(PONG_STAGE, queues::CPU).with_timeout(Duration::from_secs(60 * 60))
}

/// The handler answering pings.
pub fn pong_registration() -> Registration {
    Registration::new(
        PONG_STAGE,
        async_handler(|_, _| async { Ok(json!("pong")) }),
    )
}

/// Round-trips one unit through the `cpu` queue.
pub struct PingPipeline;

#[async_trait]
impl Pipeline for PingPipeline {
    type Request = ();
    type Response = String;

    fn name(&self) -> &'static str {
        "ping"
    }

    async fn execute(&self, orchestrator: &Orchestrator<'_>, _request: ()) -> Result<String> {
        orchestrator.dispatch_one(&pong_stage(), Unit::new((), 1.0)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::{run_pipeline, RunContext};
    use crate::progress::ProgressAggregator;
    use crate::substrate::{HandlerRegistry, LocalSubstrate};
    use crate::task::{InMemoryTaskRegistry, TaskRegistry, TaskState};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_ping() {
        let registry = Arc::new(InMemoryTaskRegistry::new());
        let progress = Arc::new(ProgressAggregator::new());
        let handlers = HandlerRegistry::new().with(pong_registration()).unwrap();
        let substrate =
            LocalSubstrate::new(handlers, vec![("cpu", 1)], registry.clone(), progress.clone())
                .unwrap();
        let ctx = RunContext::builder()
            .substrate(Arc::new(substrate))
            .progress(progress)
            .build();

        let outcome = run_pipeline(&ctx, &PingPipeline, ()).await;
        assert!(outcome.is_success());
        assert_eq!(outcome.payload, Some(json!("pong")));
        assert_eq!(outcome.processed, None);

        let tasks = registry.list_tasks().await.unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].name, "pong");
        assert_eq!(tasks[0].state, TaskState::Done);
    }
}
