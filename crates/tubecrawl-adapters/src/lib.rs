//! Extraction port contract + swappable extractor implementations.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tubecrawl_core::{ChannelMetadata, ItemMetadata};
use tubecrawl_storage::FetchError;

mod data_api;
mod fixture;
mod ytdlp;

pub use data_api::{channel_locator, ChannelLocator, DataApiExtractor};
pub use fixture::{load_fixture_bundle, FixtureBundle, FixtureExtractor};
pub use ytdlp::{YtDlpExtractor, USER_AGENTS};

pub const CRATE_NAME: &str = "tubecrawl-adapters";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExtractorKind {
    Fixture,
    YtDlp,
    DataApi,
}

impl std::str::FromStr for ExtractorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fixture" => Ok(Self::Fixture),
            "yt-dlp" | "ytdlp" => Ok(Self::YtDlp),
            "data-api" => Ok(Self::DataApi),
            other => Err(format!("unknown extractor: {other}")),
        }
    }
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error("extraction call timed out after {0:?}")]
    Timeout(Duration),
    #[error("extractor process failed: {0}")]
    Process(String),
    #[error(transparent)]
    Http(#[from] FetchError),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Capability that turns source URLs into structured metadata.
///
/// `Ok(None)` means the source had nothing usable for the URL; errors are
/// transport or parse failures. Callers decide which of the two is fatal.
#[async_trait]
pub trait ExtractionPort: Send + Sync {
    fn name(&self) -> &'static str;

    /// Lightweight, non-recursive channel lookup.
    async fn resolve_channel_metadata(
        &self,
        url: &str,
    ) -> Result<Option<ChannelMetadata>, AdapterError>;

    /// Item identifiers in source order, never more than `max_items`.
    async fn list_channel_item_ids(
        &self,
        channel_id: &str,
        max_items: usize,
    ) -> Result<Vec<String>, AdapterError>;

    async fn extract_item_metadata(&self, url: &str)
        -> Result<Option<ItemMetadata>, AdapterError>;
}
