//! YouTube Data API v3 extractor over the shared HTTP fetcher.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tubecrawl_core::{item_id_from_url, ChannelMetadata, ItemMetadata, Thumbnail};
use tubecrawl_storage::HttpFetcher;

use crate::{AdapterError, ExtractionPort};

const SCOPE: &str = "youtube-data-api";
const DEFAULT_BASE_URL: &str = "https://www.googleapis.com/youtube/v3";
const PAGE_SIZE: usize = 50;

/// How a channel URL addresses its channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelLocator {
    Id(String),
    Handle(String),
    Username(String),
    CustomName(String),
}

/// Classifies a channel URL. Unrecognized shapes are treated as custom names
/// built from the last path segment.
pub fn channel_locator(url: &str) -> ChannelLocator {
    let path = url
        .split_once("youtube.com/")
        .map(|(_, rest)| rest)
        .unwrap_or(url);
    let segment = |rest: &str| -> String {
        rest.chars()
            .take_while(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-' || *c == '.')
            .collect()
    };

    if let Some(rest) = path.strip_prefix("channel/") {
        ChannelLocator::Id(segment(rest))
    } else if let Some(rest) = path.strip_prefix('@') {
        ChannelLocator::Handle(segment(rest))
    } else if let Some(rest) = path.strip_prefix("user/") {
        ChannelLocator::Username(segment(rest))
    } else if let Some(rest) = path.strip_prefix("c/") {
        ChannelLocator::CustomName(segment(rest))
    } else {
        ChannelLocator::CustomName(tubecrawl_core::channel_id_from_url(url))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListResponse<T> {
    #[serde(default = "Vec::new")]
    items: Vec<T>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiThumbnail {
    url: String,
    width: Option<u32>,
    height: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Snippet {
    title: Option<String>,
    description: Option<String>,
    published_at: Option<String>,
    #[serde(default)]
    thumbnails: BTreeMap<String, ApiThumbnail>,
}

impl Snippet {
    fn thumbnails(&self) -> Vec<Thumbnail> {
        self.thumbnails
            .values()
            .map(|t| Thumbnail {
                url: t.url.clone(),
                width: t.width,
                height: t.height,
            })
            .collect()
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChannelStatistics {
    subscriber_count: Option<String>,
    video_count: Option<String>,
    view_count: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChannelResource {
    id: String,
    #[serde(default)]
    snippet: Snippet,
    #[serde(default)]
    statistics: ChannelStatistics,
}

#[derive(Debug, Deserialize)]
struct SearchResource {
    snippet: SearchSnippet,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchSnippet {
    channel_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlaylistItemResource {
    content_details: PlaylistItemDetails,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlaylistItemDetails {
    video_id: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VideoStatistics {
    view_count: Option<String>,
    like_count: Option<String>,
    comment_count: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct VideoDetails {
    duration: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VideoResource {
    id: String,
    #[serde(default)]
    snippet: Snippet,
    #[serde(default)]
    statistics: VideoStatistics,
    #[serde(default)]
    content_details: VideoDetails,
}

fn count(raw: &Option<String>) -> Option<i64> {
    raw.as_deref().and_then(|s| s.parse().ok())
}

/// The uploads playlist shares the channel id's suffix.
fn uploads_playlist_id(channel_id: &str) -> Option<String> {
    channel_id
        .strip_prefix("UC")
        .map(|rest| format!("UU{rest}"))
}

#[derive(Debug, Clone)]
pub struct DataApiExtractor {
    http: Arc<HttpFetcher>,
    api_key: String,
    base_url: String,
}

impl DataApiExtractor {
    pub fn new(http: Arc<HttpFetcher>, api_key: impl Into<String>) -> Self {
        Self {
            http,
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    async fn list<T: serde::de::DeserializeOwned>(
        &self,
        resource: &str,
        mut query: Vec<(&str, String)>,
    ) -> Result<ListResponse<T>, AdapterError> {
        query.push(("key", self.api_key.clone()));
        let url = format!("{}/{}", self.base_url, resource);
        Ok(self.http.get_json(SCOPE, &url, &query).await?)
    }

    async fn lookup_channel(&self, locator: &ChannelLocator) -> Result<Option<ChannelResource>, AdapterError> {
        let part = ("part", "snippet,statistics".to_string());
        let selector = match locator {
            ChannelLocator::Id(id) => ("id", id.clone()),
            ChannelLocator::Handle(handle) => ("forHandle", format!("@{handle}")),
            ChannelLocator::Username(name) => ("forUsername", name.clone()),
            ChannelLocator::CustomName(name) => {
                let found: ListResponse<SearchResource> = self
                    .list(
                        "search",
                        vec![
                            ("part", "snippet".to_string()),
                            ("type", "channel".to_string()),
                            ("maxResults", "1".to_string()),
                            ("q", name.clone()),
                        ],
                    )
                    .await?;
                let Some(hit) = found.items.into_iter().next() else {
                    return Ok(None);
                };
                ("id", hit.snippet.channel_id)
            }
        };
        let resp: ListResponse<ChannelResource> = self.list("channels", vec![part, selector]).await?;
        Ok(resp.items.into_iter().next())
    }
}

#[async_trait]
impl ExtractionPort for DataApiExtractor {
    fn name(&self) -> &'static str {
        "data-api"
    }

    async fn resolve_channel_metadata(
        &self,
        url: &str,
    ) -> Result<Option<ChannelMetadata>, AdapterError> {
        let Some(channel) = self.lookup_channel(&channel_locator(url)).await? else {
            return Ok(None);
        };
        Ok(Some(ChannelMetadata {
            thumbnails: channel.snippet.thumbnails(),
            channel_id: Some(channel.id),
            title: channel.snippet.title,
            description: channel.snippet.description,
            follower_count: count(&channel.statistics.subscriber_count),
            item_count: count(&channel.statistics.video_count),
            view_count: count(&channel.statistics.view_count),
        }))
    }

    async fn list_channel_item_ids(
        &self,
        channel_id: &str,
        max_items: usize,
    ) -> Result<Vec<String>, AdapterError> {
        let playlist_id = uploads_playlist_id(channel_id).ok_or_else(|| {
            AdapterError::Message(format!("{channel_id} is not a canonical channel id"))
        })?;

        let mut ids = Vec::new();
        let mut page_token: Option<String> = None;
        while ids.len() < max_items {
            let mut query = vec![
                ("part", "contentDetails".to_string()),
                ("playlistId", playlist_id.clone()),
                ("maxResults", (max_items - ids.len()).min(PAGE_SIZE).to_string()),
            ];
            if let Some(token) = page_token.take() {
                query.push(("pageToken", token));
            }
            let page: ListResponse<PlaylistItemResource> = self.list("playlistItems", query).await?;
            ids.extend(page.items.into_iter().map(|i| i.content_details.video_id));
            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }
        ids.truncate(max_items);
        Ok(ids)
    }

    async fn extract_item_metadata(
        &self,
        url: &str,
    ) -> Result<Option<ItemMetadata>, AdapterError> {
        let Some(video_id) = item_id_from_url(url) else {
            return Ok(None);
        };
        let resp: ListResponse<VideoResource> = self
            .list(
                "videos",
                vec![
                    ("part", "snippet,statistics,contentDetails".to_string()),
                    ("id", video_id),
                ],
            )
            .await?;
        Ok(resp.items.into_iter().next().map(|video| ItemMetadata {
            thumbnails: video.snippet.thumbnails(),
            item_id: Some(video.id),
            title: video.snippet.title,
            description: video.snippet.description,
            duration: video.content_details.duration,
            view_count: count(&video.statistics.view_count),
            like_count: count(&video.statistics.like_count),
            comment_count: count(&video.statistics.comment_count),
            upload_date: video.snippet.published_at,
        }))
    }
}
