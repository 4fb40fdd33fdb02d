//! Single-item fetch worker.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};
use tubecrawl_adapters::{AdapterError, ExtractionPort};
use tubecrawl_core::{item_id_from_url, ItemDraft, ItemMetadata};
use tubecrawl_storage::CrawlStore;

use crate::jitter::JitterPolicy;

/// Bounds an extraction call; a timeout is reported like any other port error.
pub(crate) async fn with_timeout<T>(
    limit: Duration,
    call: impl Future<Output = Result<T, AdapterError>>,
) -> Result<T, AdapterError> {
    tokio::time::timeout(limit, call)
        .await
        .map_err(|_| AdapterError::Timeout(limit))?
}

/// Fetches one item and persists it if it is new.
///
/// Every failure is contained here: the worker logs and reports `false` so a
/// bad item never aborts its batch.
#[derive(Clone)]
pub struct FetchWorker {
    port: Arc<dyn ExtractionPort>,
    store: Arc<dyn CrawlStore>,
    jitter: JitterPolicy,
    call_timeout: Duration,
}

impl FetchWorker {
    pub fn new(
        port: Arc<dyn ExtractionPort>,
        store: Arc<dyn CrawlStore>,
        jitter: JitterPolicy,
        call_timeout: Duration,
    ) -> Self {
        Self {
            port,
            store,
            jitter,
            call_timeout,
        }
    }

    /// `true` only when this call created the item record.
    pub async fn fetch_and_store(&self, channel_id: &str, item_url: &str) -> bool {
        match self.try_fetch_and_store(channel_id, item_url).await {
            Ok(created) => created,
            Err(err) => {
                warn!(item_url, error = %format!("{err:#}"), "item fetch failed");
                false
            }
        }
    }

    async fn try_fetch_and_store(&self, channel_id: &str, item_url: &str) -> anyhow::Result<bool> {
        let Some(item_id) = item_id_from_url(item_url) else {
            warn!(item_url, "could not parse item id from url");
            return Ok(false);
        };

        if self.store.item_exists(&item_id).await? {
            debug!(item_id, "item already stored, skipping");
            return Ok(false);
        }

        JitterPolicy::pause(self.jitter.before_extraction).await;

        let metadata = with_timeout(self.call_timeout, self.port.extract_item_metadata(item_url)).await?;
        let metadata = match metadata {
            Some(meta) if meta != ItemMetadata::default() => meta,
            _ => {
                warn!(item_id, "extractor returned no item metadata");
                return Ok(false);
            }
        };

        let insert = self
            .store
            .get_or_create_item(ItemDraft::from_metadata(item_id, channel_id, item_url, &metadata))
            .await?;
        if insert.created {
            debug!(item_id = %insert.item.item_id, "stored new item");
        } else {
            debug!(item_id = %insert.item.item_id, "item created concurrently by another worker");
        }
        Ok(insert.created)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{metadata_for, ScriptedPort};
    use tubecrawl_core::item_url;
    use tubecrawl_storage::MemoryStore;

    fn worker(port: Arc<ScriptedPort>, store: Arc<MemoryStore>) -> FetchWorker {
        FetchWorker::new(port, store, JitterPolicy::none(), Duration::from_secs(5))
    }

    #[tokio::test]
    async fn stores_new_items_once() {
        let port = Arc::new(ScriptedPort::with_items("UCchan", &["a1", "a2"]));
        let store = Arc::new(MemoryStore::new());
        let worker = worker(port.clone(), store.clone());

        assert!(worker.fetch_and_store("UCchan", &item_url("a1")).await);
        assert!(!worker.fetch_and_store("UCchan", &item_url("a1")).await);
        assert_eq!(store.item_count(), 1);
        assert_eq!(port.item_calls(), 1);
    }

    #[tokio::test]
    async fn unparsable_urls_never_reach_the_port_or_store() {
        let port = Arc::new(ScriptedPort::with_items("UCchan", &["a1"]));
        let store = Arc::new(MemoryStore::new());
        let worker = worker(port.clone(), store.clone());

        assert!(!worker.fetch_and_store("UCchan", "https://example.com/nope").await);
        assert_eq!(port.item_calls(), 0);
        assert_eq!(store.item_count(), 0);
    }

    #[tokio::test]
    async fn empty_or_failed_extraction_returns_false() {
        let port = Arc::new(
            ScriptedPort::with_items("UCchan", &["ok"])
                .with_item_metadata("blank", ItemMetadata::default())
                .with_failing_item("boom"),
        );
        let store = Arc::new(MemoryStore::new());
        let worker = worker(port, store.clone());

        assert!(!worker.fetch_and_store("UCchan", &item_url("blank")).await);
        assert!(!worker.fetch_and_store("UCchan", &item_url("boom")).await);
        assert!(!worker.fetch_and_store("UCchan", &item_url("missing")).await);
        assert!(worker.fetch_and_store("UCchan", &item_url("ok")).await);
        assert_eq!(store.item_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_extraction_times_out() {
        let port = Arc::new(
            ScriptedPort::with_items("UCchan", &["slow"]).with_item_latency(Duration::from_secs(60)),
        );
        let store = Arc::new(MemoryStore::new());
        let worker = FetchWorker::new(port, store.clone(), JitterPolicy::none(), Duration::from_secs(1));

        assert!(!worker.fetch_and_store("UCchan", &item_url("slow")).await);
        assert_eq!(store.item_count(), 0);
    }

    #[test]
    fn metadata_helper_is_never_empty() {
        assert_ne!(metadata_for("x"), ItemMetadata::default());
    }
}
