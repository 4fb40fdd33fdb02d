//! Batched and sequential item scheduling.

use async_trait::async_trait;
use futures::{stream, StreamExt};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::jitter::JitterPolicy;
use crate::worker::FetchWorker;
use crate::PipelineError;

/// Upper bound on concurrent workers inside one batch.
pub const MAX_POOL_SIZE: usize = 5;

const SEQUENTIAL_PROGRESS_EVERY: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchProgress {
    /// 1-based; for sequential runs this counts progress checkpoints.
    pub batch_index: usize,
    pub total_batches: usize,
    pub batch_scraped: usize,
    pub scraped_so_far: usize,
    pub processed_so_far: usize,
}

/// Receives a checkpoint after every completed batch.
#[async_trait]
pub trait ProgressSink: Send + Sync {
    async fn record(&self, progress: BatchProgress) -> anyhow::Result<()>;
}

pub struct NoProgress;

#[async_trait]
impl ProgressSink for NoProgress {
    async fn record(&self, _progress: BatchProgress) -> anyhow::Result<()> {
        Ok(())
    }
}

pub fn pool_size(batch_size: usize) -> usize {
    batch_size.clamp(1, MAX_POOL_SIZE)
}

/// Consecutive, order-preserving chunks. A zero batch size is treated as one.
pub fn partition(urls: &[String], batch_size: usize) -> Vec<&[String]> {
    urls.chunks(batch_size.max(1)).collect()
}

pub struct BatchScheduler<'a> {
    worker: &'a FetchWorker,
    jitter: JitterPolicy,
    cancel: CancellationToken,
}

impl<'a> BatchScheduler<'a> {
    pub fn new(worker: &'a FetchWorker, jitter: JitterPolicy, cancel: CancellationToken) -> Self {
        Self {
            worker,
            jitter,
            cancel,
        }
    }

    /// Runs batches strictly one after another. Returns the number of newly
    /// stored items.
    pub async fn scrape_in_batches(
        &self,
        channel_id: &str,
        urls: &[String],
        batch_size: usize,
        progress: &dyn ProgressSink,
    ) -> Result<usize, PipelineError> {
        let batches = partition(urls, batch_size);
        let total_batches = batches.len();
        let pool = pool_size(batch_size);
        let mut scraped = 0;
        let mut processed = 0;

        for (index, batch) in batches.into_iter().enumerate() {
            if self.cancel.is_cancelled() {
                return Err(PipelineError::Cancelled);
            }
            let started = Instant::now();
            info!(
                batch = index + 1,
                total_batches,
                size = batch.len(),
                pool,
                "processing batch"
            );

            // Futures own their inputs; crawls run inside spawned tasks.
            let outcomes: Vec<bool> = stream::iter(batch.to_vec())
                .map(|url| {
                    let worker = self.worker.clone();
                    let channel_id = channel_id.to_owned();
                    async move { worker.fetch_and_store(&channel_id, &url).await }
                })
                .buffer_unordered(pool)
                .collect()
                .await;
            let batch_scraped = outcomes.into_iter().filter(|created| *created).count();

            scraped += batch_scraped;
            processed += batch.len();
            info!(
                batch = index + 1,
                batch_scraped,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "batch completed"
            );
            progress
                .record(BatchProgress {
                    batch_index: index + 1,
                    total_batches,
                    batch_scraped,
                    scraped_so_far: scraped,
                    processed_so_far: processed,
                })
                .await?;

            if index + 1 < total_batches {
                self.wait(self.jitter.between_batches.sample()).await?;
            }
        }
        Ok(scraped)
    }

    /// One item at a time with a politeness delay between items.
    pub async fn scrape_sequential(
        &self,
        channel_id: &str,
        urls: &[String],
        progress: &dyn ProgressSink,
    ) -> Result<usize, PipelineError> {
        let total = urls.len();
        let checkpoints = total.div_ceil(SEQUENTIAL_PROGRESS_EVERY);
        let mut scraped = 0;
        let mut since_checkpoint = 0;

        for (index, url) in urls.iter().enumerate() {
            if self.cancel.is_cancelled() {
                return Err(PipelineError::Cancelled);
            }
            if self.worker.fetch_and_store(channel_id, url).await {
                scraped += 1;
                since_checkpoint += 1;
            }

            let processed = index + 1;
            if processed % SEQUENTIAL_PROGRESS_EVERY == 0 || processed == total {
                info!(processed, total, scraped, "sequential progress");
                progress
                    .record(BatchProgress {
                        batch_index: processed.div_ceil(SEQUENTIAL_PROGRESS_EVERY),
                        total_batches: checkpoints,
                        batch_scraped: since_checkpoint,
                        scraped_so_far: scraped,
                        processed_so_far: processed,
                    })
                    .await?;
                since_checkpoint = 0;
            }

            if processed < total {
                self.wait(self.jitter.between_sequential_items.sample()).await?;
            }
        }
        Ok(scraped)
    }

    async fn wait(&self, delay: std::time::Duration) -> Result<(), PipelineError> {
        if delay.is_zero() {
            return Ok(());
        }
        info!(delay_ms = delay.as_millis() as u64, "waiting before next request");
        tokio::select! {
            _ = tokio::time::sleep(delay) => Ok(()),
            _ = self.cancel.cancelled() => Err(PipelineError::Cancelled),
        }
    }
}
