//! Crawl pipeline: jitter, fetch workers, batch scheduling, channel
//! resolution, task orchestration with retries, and an in-process task queue.

use std::sync::Arc;

use anyhow::Result;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tubecrawl_adapters::AdapterError;
use tubecrawl_core::{InvalidTransition, TaskStatus};

mod batch;
mod config;
mod jitter;
mod orchestrator;
mod queue;
mod resolver;
#[cfg(test)]
mod testing;
mod worker;

pub use batch::{partition, pool_size, BatchProgress, BatchScheduler, NoProgress, ProgressSink, MAX_POOL_SIZE};
pub use config::{build_extractor, build_store, load_channel_registry, ChannelEntry, ChannelRegistry, CrawlConfig};
pub use jitter::{DelayRange, JitterPolicy};
pub use orchestrator::{
    CrawlRequest, CrawlSummary, RetryPolicy, RunOutcome, TaskOrchestrator, DEFAULT_BATCH_SIZE,
    DEFAULT_CALL_TIMEOUT, DEFAULT_MAX_ITEMS,
};
pub use queue::{group_task_token, GroupEntry, TaskQueue, TaskReport};
pub use resolver::ChannelResolver;
pub use worker::FetchWorker;

pub const CRATE_NAME: &str = "tubecrawl-sync";

/// Task-level failures. Per-item failures never surface here.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("task {0} not found")]
    TaskNotFound(String),
    #[error("task {task_token} is already {status} and will not run again")]
    Terminal { task_token: String, status: TaskStatus },
    #[error("failed to extract channel information: {0}")]
    ChannelResolutionFailed(String),
    #[error("failed to enumerate channel items: {0}")]
    Enumeration(#[source] AdapterError),
    #[error("crawl cancelled")]
    Cancelled,
    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

impl PipelineError {
    /// Missing or finished tasks, cancellation and state-machine violations
    /// will not get better by waiting.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Self::TaskNotFound(_) | Self::Terminal { .. } | Self::Cancelled | Self::InvalidTransition(_)
        )
    }

    /// Failures raised before this run took ownership of the task record.
    fn left_task_untouched(&self) -> bool {
        matches!(
            self,
            Self::TaskNotFound(_) | Self::Terminal { .. } | Self::InvalidTransition(_)
        )
    }
}

/// Builds the configured store and extractor and wires them into a queue.
pub async fn build_queue(config: &CrawlConfig, cancel: CancellationToken) -> Result<TaskQueue> {
    let store = build_store(config).await?;
    let port = build_extractor(config)?;
    let orchestrator = TaskOrchestrator::new(port, store)
        .with_jitter(config.jitter())
        .with_call_timeout(config.call_timeout())
        .with_cancellation(cancel);
    Ok(TaskQueue::new(Arc::new(orchestrator)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryability_follows_error_kind() {
        assert!(PipelineError::ChannelResolutionFailed("x".into()).is_retryable());
        assert!(PipelineError::Enumeration(AdapterError::Message("x".into())).is_retryable());
        assert!(PipelineError::Store(anyhow::anyhow!("db down")).is_retryable());
        assert!(!PipelineError::Cancelled.is_retryable());
        assert!(!PipelineError::TaskNotFound("t".into()).is_retryable());
        assert!(!PipelineError::Terminal {
            task_token: "t".into(),
            status: TaskStatus::Failed,
        }
        .is_retryable());
    }

    #[test]
    fn messages_name_the_failing_phase() {
        let err = PipelineError::Enumeration(AdapterError::Message("boom".into()));
        assert_eq!(err.to_string(), "failed to enumerate channel items: boom");
    }
}
