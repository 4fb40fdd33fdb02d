//! Fixture-first extractor backed by captured JSON bundles on disk.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tubecrawl_core::{channel_id_from_url, item_id_from_url, ChannelMetadata, ItemMetadata};

use crate::{AdapterError, ExtractionPort};

/// One captured channel: its metadata, the ordered upload list, and per-item metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureBundle {
    pub source_url: String,
    pub channel: ChannelMetadata,
    #[serde(default)]
    pub item_ids: Vec<String>,
    #[serde(default)]
    pub items: HashMap<String, ItemMetadata>,
}

impl FixtureBundle {
    fn channel_id(&self) -> String {
        self.channel
            .channel_id
            .clone()
            .unwrap_or_else(|| channel_id_from_url(&self.source_url))
    }
}

pub fn load_fixture_bundle(path: impl AsRef<Path>) -> Result<FixtureBundle> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

#[derive(Debug, Clone, Default)]
pub struct FixtureExtractor {
    bundles: Vec<FixtureBundle>,
}

impl FixtureExtractor {
    pub fn new(bundles: Vec<FixtureBundle>) -> Self {
        Self { bundles }
    }

    /// Loads every `<dir>/<name>/channel.json`.
    pub fn from_dir(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let mut entries = fs::read_dir(dir)
            .with_context(|| format!("reading fixture dir {}", dir.display()))?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path().join("channel.json"))
            .filter(|path| path.exists())
            .collect::<Vec<_>>();
        entries.sort();

        let bundles = entries
            .iter()
            .map(load_fixture_bundle)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(bundles))
    }

    fn bundle_for_url(&self, url: &str) -> Option<&FixtureBundle> {
        let wanted = channel_id_from_url(url);
        self.bundles
            .iter()
            .find(|b| b.source_url == url)
            .or_else(|| self.bundles.iter().find(|b| b.channel_id() == wanted))
    }
}

#[async_trait]
impl ExtractionPort for FixtureExtractor {
    fn name(&self) -> &'static str {
        "fixture"
    }

    async fn resolve_channel_metadata(
        &self,
        url: &str,
    ) -> Result<Option<ChannelMetadata>, AdapterError> {
        Ok(self.bundle_for_url(url).map(|b| b.channel.clone()))
    }

    async fn list_channel_item_ids(
        &self,
        channel_id: &str,
        max_items: usize,
    ) -> Result<Vec<String>, AdapterError> {
        let bundle = self
            .bundles
            .iter()
            .find(|b| b.channel_id() == channel_id)
            .ok_or_else(|| AdapterError::Message(format!("no fixture for channel {channel_id}")))?;
        Ok(bundle.item_ids.iter().take(max_items).cloned().collect())
    }

    async fn extract_item_metadata(
        &self,
        url: &str,
    ) -> Result<Option<ItemMetadata>, AdapterError> {
        let Some(item_id) = item_id_from_url(url) else {
            return Ok(None);
        };
        Ok(self
            .bundles
            .iter()
            .find_map(|b| b.items.get(&item_id))
            .cloned())
    }
}
