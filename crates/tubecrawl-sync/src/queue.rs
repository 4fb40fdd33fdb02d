//! In-process task queue: creates task records, drives retries, fans out groups.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use tokio::task::JoinSet;
use tracing::{info, warn};
use tubecrawl_core::CrawlTask;

use crate::orchestrator::{CrawlRequest, RunOutcome, TaskOrchestrator};

/// Final result of a task after all of its attempts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskReport {
    pub task_token: String,
    pub source_url: String,
    pub outcome: RunOutcome,
    pub runs: u32,
    pub retry_delays: Vec<Duration>,
}

/// Group member: a channel URL plus its item cap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupEntry {
    pub source_url: String,
    pub max_items: usize,
}

#[derive(Clone)]
pub struct TaskQueue {
    orchestrator: Arc<TaskOrchestrator>,
}

pub fn group_task_token(index: usize, unix_ts: i64) -> String {
    format!("batch_{index}_{unix_ts}")
}

impl TaskQueue {
    pub fn new(orchestrator: Arc<TaskOrchestrator>) -> Self {
        Self { orchestrator }
    }

    pub fn orchestrator(&self) -> &Arc<TaskOrchestrator> {
        &self.orchestrator
    }

    /// Records a pending task and runs it to a terminal outcome.
    pub async fn submit(&self, request: CrawlRequest) -> Result<TaskReport> {
        let task = CrawlTask::new(&request.task_token, &request.source_url, Utc::now());
        self.orchestrator.store().create_task(&task).await?;
        info!(task = %request.task_token, url = %request.source_url, "task submitted");
        Ok(self.drive(request).await)
    }

    /// Runs an already-recorded task, honoring retry requests until it
    /// completes, fails terminally, or the queue is cancelled.
    pub async fn drive(&self, request: CrawlRequest) -> TaskReport {
        let cancel = self.orchestrator.cancellation().clone();
        let mut attempt = 0;
        let mut retry_delays = Vec::new();
        loop {
            let outcome = self.orchestrator.run(&request, attempt).await;
            let RunOutcome::RetryRequested { attempt: next, delay, error } = outcome else {
                return TaskReport {
                    task_token: request.task_token,
                    source_url: request.source_url,
                    outcome,
                    runs: attempt + 1,
                    retry_delays,
                };
            };

            warn!(
                task = %request.task_token,
                next_attempt = next,
                delay_secs = delay.as_secs(),
                error = %error,
                "task will be retried"
            );
            retry_delays.push(delay);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => {
                    return TaskReport {
                        task_token: request.task_token,
                        source_url: request.source_url,
                        outcome: RunOutcome::Failed { error: format!("cancelled while waiting to retry: {error}") },
                        runs: attempt + 1,
                        retry_delays,
                    };
                }
            }
            attempt = next;
        }
    }

    /// Submits one independent task per entry and waits for all of them.
    /// Reports arrive in completion order.
    pub async fn dispatch_group(&self, entries: Vec<GroupEntry>) -> Vec<Result<TaskReport>> {
        let unix_ts = Utc::now().timestamp();
        let mut set = JoinSet::new();
        for (index, entry) in entries.into_iter().enumerate() {
            let queue = self.clone();
            let request = CrawlRequest::new(group_task_token(index, unix_ts), entry.source_url)
                .with_max_items(entry.max_items);
            set.spawn(async move { queue.submit(request).await });
        }
        info!(tasks = set.len(), "group dispatched");

        let mut reports = Vec::with_capacity(set.len());
        while let Some(joined) = set.join_next().await {
            reports.push(joined.map_err(anyhow::Error::from).and_then(|r| r));
        }
        reports
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jitter::JitterPolicy;
    use crate::testing::ScriptedPort;
    use tubecrawl_core::TaskStatus;
    use tubecrawl_storage::{CrawlStore, MemoryStore};

    const URL: &str = "https://www.youtube.com/channel/UCchan";

    fn queue(port: ScriptedPort, store: Arc<MemoryStore>) -> TaskQueue {
        let orchestrator = TaskOrchestrator::new(Arc::new(port), store).with_jitter(JitterPolicy::none());
        TaskQueue::new(Arc::new(orchestrator))
    }

    #[test]
    fn group_tokens_carry_index_and_timestamp() {
        assert_eq!(group_task_token(2, 1_700_000_000), "batch_2_1700000000");
    }

    #[tokio::test(start_paused = true)]
    async fn persistent_failures_back_off_then_fail() {
        let store = Arc::new(MemoryStore::new());
        let q = queue(ScriptedPort::with_items("UCchan", &[]).failing_resolution(), store.clone());

        let started = tokio::time::Instant::now();
        let report = q.submit(CrawlRequest::new("t1", URL)).await.unwrap();

        assert!(matches!(report.outcome, RunOutcome::Failed { .. }));
        assert_eq!(
            report.retry_delays,
            vec![
                Duration::from_secs(60),
                Duration::from_secs(120),
                Duration::from_secs(240)
            ]
        );
        assert_eq!(report.runs, 4);
        assert!(started.elapsed() >= Duration::from_secs(420));

        let task = store.get_task("t1").await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.attempts, 4);
    }

    #[tokio::test]
    async fn duplicate_submission_is_rejected() {
        let store = Arc::new(MemoryStore::new());
        let q = queue(ScriptedPort::with_items("UCchan", &["a"]), store);

        q.submit(CrawlRequest::new("t1", URL)).await.unwrap();
        assert!(q.submit(CrawlRequest::new("t1", URL)).await.is_err());
    }

    #[tokio::test]
    async fn group_runs_every_entry_independently() {
        let store = Arc::new(MemoryStore::new());
        let q = queue(ScriptedPort::with_items("UCchan", &["a", "b", "c"]), store.clone());

        let reports = q
            .dispatch_group(vec![
                GroupEntry {
                    source_url: URL.to_string(),
                    max_items: 2,
                },
                GroupEntry {
                    source_url: URL.to_string(),
                    max_items: 3,
                },
            ])
            .await;

        assert_eq!(reports.len(), 2);
        for report in &reports {
            let report = report.as_ref().unwrap();
            assert!(report.task_token.starts_with("batch_"));
            assert!(matches!(report.outcome, RunOutcome::Completed(_)));
        }
        assert_eq!(store.item_count(), 3);
        assert_eq!(store.channel_count(), 1);
    }
}
