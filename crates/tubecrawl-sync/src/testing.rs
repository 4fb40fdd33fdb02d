//! Scripted extraction port shared by the unit tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tubecrawl_adapters::{AdapterError, ExtractionPort};
use tubecrawl_core::{item_id_from_url, ChannelMetadata, ItemMetadata};

pub(crate) fn metadata_for(item_id: &str) -> ItemMetadata {
    ItemMetadata {
        item_id: Some(item_id.to_string()),
        title: Some(format!("Episode {item_id}")),
        upload_date: Some("20240105".to_string()),
        view_count: Some(10),
        ..ItemMetadata::default()
    }
}

#[derive(Debug, Clone)]
pub(crate) struct ItemCall {
    pub item_id: String,
    pub started: Instant,
    pub finished: Instant,
}

/// In-memory extraction port with call accounting.
#[derive(Default)]
pub(crate) struct ScriptedPort {
    channel: Option<ChannelMetadata>,
    resolve_error: bool,
    list_error: bool,
    item_ids: Vec<String>,
    items: HashMap<String, ItemMetadata>,
    failing: HashSet<String>,
    item_latency: Duration,
    resolve_calls: AtomicUsize,
    list_calls: AtomicUsize,
    item_calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    requested_max: Mutex<Vec<usize>>,
    calls: Mutex<Vec<ItemCall>>,
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ScriptedPort {
    pub fn with_items(channel_id: &str, ids: &[&str]) -> Self {
        Self {
            channel: Some(ChannelMetadata {
                channel_id: Some(channel_id.to_string()),
                title: Some("Scripted Channel".to_string()),
                follower_count: Some(100),
                ..ChannelMetadata::default()
            }),
            item_ids: ids.iter().map(|id| id.to_string()).collect(),
            items: ids.iter().map(|id| (id.to_string(), metadata_for(id))).collect(),
            ..Self::default()
        }
    }

    pub fn with_channel(mut self, channel: Option<ChannelMetadata>) -> Self {
        self.channel = channel;
        self
    }

    pub fn with_item_metadata(mut self, id: &str, meta: ItemMetadata) -> Self {
        self.items.insert(id.to_string(), meta);
        self
    }

    pub fn with_failing_item(mut self, id: &str) -> Self {
        self.failing.insert(id.to_string());
        self
    }

    pub fn with_item_latency(mut self, latency: Duration) -> Self {
        self.item_latency = latency;
        self
    }

    pub fn failing_resolution(mut self) -> Self {
        self.resolve_error = true;
        self
    }

    pub fn failing_enumeration(mut self) -> Self {
        self.list_error = true;
        self
    }

    pub fn resolve_calls(&self) -> usize {
        self.resolve_calls.load(Ordering::SeqCst)
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn item_calls(&self) -> usize {
        self.item_calls.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn requested_max(&self) -> Vec<usize> {
        self.requested_max.lock().unwrap().clone()
    }

    pub fn calls(&self) -> Vec<ItemCall> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ExtractionPort for ScriptedPort {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn resolve_channel_metadata(
        &self,
        _url: &str,
    ) -> Result<Option<ChannelMetadata>, AdapterError> {
        self.resolve_calls.fetch_add(1, Ordering::SeqCst);
        if self.resolve_error {
            return Err(AdapterError::Message("channel lookup exploded".into()));
        }
        Ok(self.channel.clone())
    }

    async fn list_channel_item_ids(
        &self,
        _channel_id: &str,
        max_items: usize,
    ) -> Result<Vec<String>, AdapterError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        self.requested_max.lock().unwrap().push(max_items);
        if self.list_error {
            return Err(AdapterError::Message("listing exploded".into()));
        }
        Ok(self.item_ids.iter().take(max_items).cloned().collect())
    }

    async fn extract_item_metadata(
        &self,
        url: &str,
    ) -> Result<Option<ItemMetadata>, AdapterError> {
        self.item_calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        let _guard = InFlight(&self.in_flight);
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let started = Instant::now();
        if !self.item_latency.is_zero() {
            tokio::time::sleep(self.item_latency).await;
        }
        let item_id = item_id_from_url(url).unwrap_or_default();
        self.calls.lock().unwrap().push(ItemCall {
            item_id: item_id.clone(),
            started,
            finished: Instant::now(),
        });

        if self.failing.contains(&item_id) {
            return Err(AdapterError::Message(format!("extraction of {item_id} exploded")));
        }
        Ok(self.items.get(&item_id).cloned())
    }
}
