//! Persistence store contract, in-memory and Postgres stores, and HTTP fetch utilities.

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tubecrawl_core::{Channel, ChannelDraft, CrawlTask, Item, ItemDraft};

mod http;
mod pg;

pub use http::{FetchError, HttpFetcher, HttpFetcherConfig, RequestPacer, RequestRetry};
pub use pg::PgStore;

pub const CRATE_NAME: &str = "tubecrawl-storage";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelUpsert {
    pub channel: Channel,
    pub created: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemInsert {
    pub item: Item,
    pub created: bool,
}

/// Keyed persistence for channels, items and crawl tasks.
///
/// Implementations must make `upsert_channel` and `get_or_create_item` atomic per
/// natural identifier: two concurrent calls for the same key observe exactly one
/// creation.
#[async_trait]
pub trait CrawlStore: Send + Sync {
    async fn upsert_channel(&self, draft: ChannelDraft) -> Result<ChannelUpsert>;
    async fn get_channel(&self, channel_id: &str) -> Result<Option<Channel>>;
    async fn item_exists(&self, item_id: &str) -> Result<bool>;
    async fn get_or_create_item(&self, draft: ItemDraft) -> Result<ItemInsert>;
    async fn list_items(&self, channel_id: &str) -> Result<Vec<Item>>;
    async fn create_task(&self, task: &CrawlTask) -> Result<()>;
    async fn get_task(&self, task_token: &str) -> Result<Option<CrawlTask>>;
    async fn save_task(&self, task: &CrawlTask) -> Result<()>;
}

/// Sharded in-process store. Per-key atomicity comes from the shard lock held by
/// `DashMap::entry`.
#[derive(Debug, Default)]
pub struct MemoryStore {
    channels: DashMap<String, Channel>,
    items: DashMap<String, Item>,
    tasks: DashMap<String, CrawlTask>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn item_count(&self) -> usize {
        self.items.len()
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}

#[async_trait]
impl CrawlStore for MemoryStore {
    async fn upsert_channel(&self, draft: ChannelDraft) -> Result<ChannelUpsert> {
        let now = Utc::now();
        match self.channels.entry(draft.channel_id.clone()) {
            Entry::Occupied(mut entry) => {
                draft.refresh(entry.get_mut(), now);
                Ok(ChannelUpsert {
                    channel: entry.get().clone(),
                    created: false,
                })
            }
            Entry::Vacant(entry) => {
                let channel = draft.into_channel(now);
                entry.insert(channel.clone());
                Ok(ChannelUpsert {
                    channel,
                    created: true,
                })
            }
        }
    }

    async fn get_channel(&self, channel_id: &str) -> Result<Option<Channel>> {
        Ok(self.channels.get(channel_id).map(|c| c.clone()))
    }

    async fn item_exists(&self, item_id: &str) -> Result<bool> {
        Ok(self.items.contains_key(item_id))
    }

    async fn get_or_create_item(&self, draft: ItemDraft) -> Result<ItemInsert> {
        match self.items.entry(draft.item_id.clone()) {
            Entry::Occupied(entry) => Ok(ItemInsert {
                item: entry.get().clone(),
                created: false,
            }),
            Entry::Vacant(entry) => {
                let item = draft.into_item(Utc::now());
                entry.insert(item.clone());
                Ok(ItemInsert {
                    item,
                    created: true,
                })
            }
        }
    }

    async fn list_items(&self, channel_id: &str) -> Result<Vec<Item>> {
        let mut items: Vec<Item> = self
            .items
            .iter()
            .filter(|item| item.channel_id == channel_id)
            .map(|item| item.clone())
            .collect();
        items.sort_by(|a, b| b.upload_date.cmp(&a.upload_date));
        Ok(items)
    }

    async fn create_task(&self, task: &CrawlTask) -> Result<()> {
        match self.tasks.entry(task.task_token.clone()) {
            Entry::Occupied(_) => bail!("task {} already exists", task.task_token),
            Entry::Vacant(entry) => {
                entry.insert(task.clone());
                Ok(())
            }
        }
    }

    async fn get_task(&self, task_token: &str) -> Result<Option<CrawlTask>> {
        Ok(self.tasks.get(task_token).map(|t| t.clone()))
    }

    async fn save_task(&self, task: &CrawlTask) -> Result<()> {
        self.tasks.insert(task.task_token.clone(), task.clone());
        Ok(())
    }
}
