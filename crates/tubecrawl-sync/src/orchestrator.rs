//! Per-task crawl lifecycle: resolve, enumerate, fetch, finalize.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};
use tubecrawl_adapters::ExtractionPort;
use tubecrawl_core::{item_url, CrawlTask, TaskStatus};
use tubecrawl_storage::CrawlStore;

use crate::batch::{BatchProgress, BatchScheduler, ProgressSink};
use crate::jitter::JitterPolicy;
use crate::resolver::ChannelResolver;
use crate::worker::{with_timeout, FetchWorker};
use crate::PipelineError;

pub const DEFAULT_MAX_ITEMS: usize = 20;
pub const DEFAULT_BATCH_SIZE: usize = 10;
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrawlRequest {
    pub task_token: String,
    pub source_url: String,
    pub max_items: usize,
    pub use_parallel: bool,
    pub batch_size: usize,
}

impl CrawlRequest {
    pub fn new(task_token: impl Into<String>, source_url: impl Into<String>) -> Self {
        Self {
            task_token: task_token.into(),
            source_url: source_url.into(),
            max_items: DEFAULT_MAX_ITEMS,
            use_parallel: true,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    pub fn with_max_items(mut self, max_items: usize) -> Self {
        self.max_items = max_items;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn sequential(mut self) -> Self {
        self.use_parallel = false;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CrawlSummary {
    pub status: TaskStatus,
    pub channel_id: String,
    pub items_scraped: usize,
    pub total_items: usize,
    pub elapsed: Duration,
}

/// What a single run asks of its caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Completed(CrawlSummary),
    /// Re-run after `delay` with `attempt` as the new attempt index.
    RetryRequested {
        attempt: u32,
        delay: Duration,
        error: String,
    },
    Failed {
        error: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// `base * 2^attempt`: 60s, 120s, 240s with the defaults.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(2u32.saturating_pow(attempt))
    }

    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }
}

/// Persists `items_scraped` after every batch so partial progress survives a crash.
struct TaskProgress<'a> {
    store: &'a dyn CrawlStore,
    task: Mutex<CrawlTask>,
}

#[async_trait]
impl ProgressSink for TaskProgress<'_> {
    async fn record(&self, progress: BatchProgress) -> anyhow::Result<()> {
        let mut task = self.task.lock().await;
        task.items_scraped = progress.scraped_so_far as u32;
        self.store.save_task(&task).await
    }
}

pub struct TaskOrchestrator {
    port: Arc<dyn ExtractionPort>,
    store: Arc<dyn CrawlStore>,
    jitter: JitterPolicy,
    retry: RetryPolicy,
    call_timeout: Duration,
    cancel: CancellationToken,
}

impl TaskOrchestrator {
    pub fn new(port: Arc<dyn ExtractionPort>, store: Arc<dyn CrawlStore>) -> Self {
        Self {
            port,
            store,
            jitter: JitterPolicy::default(),
            retry: RetryPolicy::default(),
            call_timeout: DEFAULT_CALL_TIMEOUT,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_jitter(mut self, jitter: JitterPolicy) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_call_timeout(mut self, call_timeout: Duration) -> Self {
        self.call_timeout = call_timeout;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn store(&self) -> &Arc<dyn CrawlStore> {
        &self.store
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// One attempt at a task. `attempt` is 0 for the first run.
    pub async fn run(&self, request: &CrawlRequest, attempt: u32) -> RunOutcome {
        let span = info_span!(
            "crawl_task",
            task = %request.task_token,
            url = %request.source_url,
            attempt
        );
        async move {
            match self.execute(request).await {
                Ok(summary) => RunOutcome::Completed(summary),
                Err(err) => self.handle_failure(request, attempt, err).await,
            }
        }
        .instrument(span)
        .await
    }

    async fn execute(&self, request: &CrawlRequest) -> Result<CrawlSummary, PipelineError> {
        let started = Instant::now();
        let mut task = self
            .store
            .get_task(&request.task_token)
            .await?
            .ok_or_else(|| PipelineError::TaskNotFound(request.task_token.clone()))?;
        if task.is_terminal(self.retry.max_retries) {
            return Err(PipelineError::Terminal {
                task_token: task.task_token,
                status: task.status,
            });
        }

        task.transition(TaskStatus::Processing)?;
        task.attempts += 1;
        task.started_at = Some(Utc::now());
        task.completed_at = None;
        self.store.save_task(&task).await?;
        info!(max_items = request.max_items, "crawl started");

        let resolver = ChannelResolver::new(self.port.clone(), self.store.clone(), self.call_timeout);
        let channel = match resolver.resolve_channel(&request.source_url).await {
            Ok(Some(channel)) => channel,
            Ok(None) => {
                return Err(PipelineError::ChannelResolutionFailed(
                    "extractor returned no channel metadata".to_string(),
                ))
            }
            Err(err) => return Err(PipelineError::ChannelResolutionFailed(format!("{err:#}"))),
        };
        task.channel_id = Some(channel.channel_id.clone());
        self.store.save_task(&task).await?;
        JitterPolicy::pause(self.jitter.after_channel_resolution).await;

        let ids = with_timeout(
            self.call_timeout,
            self.port
                .list_channel_item_ids(&channel.channel_id, request.max_items),
        )
        .await
        .map_err(PipelineError::Enumeration)?;
        let urls: Vec<String> = ids
            .iter()
            .take(request.max_items)
            .map(|id| item_url(id))
            .collect();
        let total_items = urls.len();

        let items_scraped = if urls.is_empty() {
            warn!(channel_id = %channel.channel_id, "no items found for channel");
            0
        } else {
            info!(channel_id = %channel.channel_id, total_items, "items enumerated");
            JitterPolicy::pause(self.jitter.after_enumeration).await;

            let worker = FetchWorker::new(
                self.port.clone(),
                self.store.clone(),
                self.jitter,
                self.call_timeout,
            );
            let scheduler = BatchScheduler::new(&worker, self.jitter, self.cancel.clone());
            let progress = TaskProgress {
                store: self.store.as_ref(),
                task: Mutex::new(task),
            };
            let scraped = if request.use_parallel {
                scheduler
                    .scrape_in_batches(&channel.channel_id, &urls, request.batch_size, &progress)
                    .await?
            } else {
                scheduler
                    .scrape_sequential(&channel.channel_id, &urls, &progress)
                    .await?
            };
            task = progress.task.into_inner();
            scraped
        };

        task.transition(TaskStatus::Completed)?;
        task.items_scraped = items_scraped as u32;
        task.completed_at = Some(Utc::now());
        self.store.save_task(&task).await?;

        let summary = CrawlSummary {
            status: TaskStatus::Completed,
            channel_id: channel.channel_id,
            items_scraped,
            total_items,
            elapsed: started.elapsed(),
        };
        info!(
            items_scraped,
            total_items,
            elapsed_ms = summary.elapsed.as_millis() as u64,
            "crawl completed"
        );
        Ok(summary)
    }

    /// The stored run count wins over the caller's `attempt` when it is further
    /// along, so resubmitting a failed task cannot reset its retry budget.
    async fn handle_failure(&self, request: &CrawlRequest, attempt: u32, err: PipelineError) -> RunOutcome {
        let message = err.to_string();
        error!(error = %format!("{err:#}"), "crawl task failed");

        let mut attempt = attempt;
        if !err.left_task_untouched() {
            match self.mark_failed(&request.task_token, &message).await {
                Ok(Some(runs)) => attempt = attempt.max(runs.saturating_sub(1)),
                Ok(None) => {}
                Err(store_err) => {
                    error!(error = %format!("{store_err:#}"), "could not record task failure")
                }
            }
        }

        if err.is_retryable() && self.retry.should_retry(attempt) {
            let delay = self.retry.delay_for_attempt(attempt);
            info!(delay_secs = delay.as_secs(), next_attempt = attempt + 1, "retry requested");
            RunOutcome::RetryRequested {
                attempt: attempt + 1,
                delay,
                error: message,
            }
        } else {
            RunOutcome::Failed { error: message }
        }
    }

    /// Returns the stored run count, or `None` when the task is gone.
    async fn mark_failed(&self, task_token: &str, message: &str) -> anyhow::Result<Option<u32>> {
        let Some(mut task) = self.store.get_task(task_token).await? else {
            return Ok(None);
        };
        if task.status != TaskStatus::Processing {
            warn!(status = %task.status, "leaving task status untouched after failure");
            return Ok(Some(task.attempts));
        }
        task.transition(TaskStatus::Failed)?;
        task.error_message = Some(message.to_string());
        task.completed_at = Some(Utc::now());
        self.store.save_task(&task).await?;
        Ok(Some(task.attempts))
    }
}
