//! Channel resolution: source URL to stored channel record.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};
use tubecrawl_adapters::ExtractionPort;
use tubecrawl_core::{channel_id_from_url, Channel, ChannelDraft};
use tubecrawl_storage::CrawlStore;

use crate::worker::with_timeout;

/// Turns a source URL into a stored channel record.
///
/// Unlike items, an existing channel is refreshed on every crawl: title and
/// subscriber count are overwritten, everything else stays as first seen.
#[derive(Clone)]
pub struct ChannelResolver {
    port: Arc<dyn ExtractionPort>,
    store: Arc<dyn CrawlStore>,
    call_timeout: Duration,
}

impl ChannelResolver {
    pub fn new(
        port: Arc<dyn ExtractionPort>,
        store: Arc<dyn CrawlStore>,
        call_timeout: Duration,
    ) -> Self {
        Self {
            port,
            store,
            call_timeout,
        }
    }

    /// `Ok(None)` when the extractor has no metadata for the URL.
    pub async fn resolve_channel(&self, source_url: &str) -> anyhow::Result<Option<Channel>> {
        let metadata = with_timeout(
            self.call_timeout,
            self.port.resolve_channel_metadata(source_url),
        )
        .await?;
        let Some(metadata) = metadata else {
            warn!(source_url, "extractor returned no channel metadata");
            return Ok(None);
        };

        let channel_id = metadata
            .channel_id
            .clone()
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| channel_id_from_url(source_url));
        if channel_id.is_empty() {
            warn!(source_url, "could not derive a channel id");
            return Ok(None);
        }

        let upsert = self
            .store
            .upsert_channel(ChannelDraft::from_metadata(channel_id, source_url, &metadata))
            .await?;
        info!(
            channel_id = %upsert.channel.channel_id,
            title = %upsert.channel.title,
            created = upsert.created,
            "channel resolved"
        );
        Ok(Some(upsert.channel))
    }
}
