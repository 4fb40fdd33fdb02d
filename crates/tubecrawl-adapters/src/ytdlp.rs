//! Extractor that shells out to the `yt-dlp` executable and reads its JSON dump.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use rand::seq::IndexedRandom;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tokio::process::Command;
use tracing::debug;
use tubecrawl_core::{channel_items_url, ChannelMetadata, ItemMetadata, Thumbnail};

use crate::{AdapterError, ExtractionPort};

pub const USER_AGENTS: [&str; 5] = [
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:109.0) Gecko/20100101 Firefox/121.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10.15; rv:109.0) Gecko/20100101 Firefox/121.0",
];

#[derive(Debug, Deserialize)]
struct DumpedChannel {
    channel_id: Option<String>,
    title: Option<String>,
    description: Option<String>,
    channel_follower_count: Option<i64>,
    playlist_count: Option<i64>,
    view_count: Option<i64>,
    #[serde(default)]
    thumbnails: Vec<Thumbnail>,
}

#[derive(Debug, Deserialize)]
struct DumpedPlaylist {
    #[serde(default)]
    entries: Vec<Option<DumpedEntry>>,
}

#[derive(Debug, Deserialize)]
struct DumpedEntry {
    id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DumpedVideo {
    id: Option<String>,
    title: Option<String>,
    description: Option<String>,
    duration: Option<JsonValue>,
    view_count: Option<i64>,
    like_count: Option<i64>,
    comment_count: Option<i64>,
    upload_date: Option<String>,
    #[serde(default)]
    thumbnails: Vec<Thumbnail>,
}

#[derive(Debug, Clone)]
pub struct YtDlpExtractor {
    binary: PathBuf,
    timeout: Duration,
    proxy: Option<String>,
}

impl YtDlpExtractor {
    pub fn new(binary: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            timeout,
            proxy: None,
        }
    }

    pub fn with_proxy(mut self, proxy: Option<String>) -> Self {
        self.proxy = proxy;
        self
    }

    fn base_args(&self) -> Vec<String> {
        let user_agent = USER_AGENTS
            .choose(&mut rand::rng())
            .copied()
            .unwrap_or(USER_AGENTS[0]);
        let mut args = vec![
            "--dump-single-json".to_string(),
            "--skip-download".to_string(),
            "--quiet".to_string(),
            "--no-warnings".to_string(),
            "--extractor-retries".to_string(),
            "3".to_string(),
            "--user-agent".to_string(),
            user_agent.to_string(),
        ];
        if let Some(proxy) = &self.proxy {
            args.push("--proxy".to_string());
            args.push(proxy.clone());
        }
        args
    }

    /// Runs one dump. The child is killed if the timeout fires first.
    async fn dump<T: DeserializeOwned>(&self, extra: &[String], url: &str) -> Result<T, AdapterError> {
        let mut command = Command::new(&self.binary);
        command
            .args(self.base_args())
            .args(extra)
            .arg(url)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        debug!(binary = %self.binary.display(), url, "running yt-dlp");

        let output = tokio::time::timeout(self.timeout, command.output())
            .await
            .map_err(|_| AdapterError::Timeout(self.timeout))??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(AdapterError::Process(format!(
                "{} exited with {}: {}",
                self.binary.display(),
                output.status,
                stderr.trim()
            )));
        }
        Ok(serde_json::from_slice(&output.stdout)?)
    }
}

fn duration_string(value: Option<JsonValue>) -> Option<String> {
    match value? {
        JsonValue::Number(n) => Some(n.to_string()),
        JsonValue::String(s) => Some(s),
        _ => None,
    }
}

#[async_trait]
impl ExtractionPort for YtDlpExtractor {
    fn name(&self) -> &'static str {
        "yt-dlp"
    }

    async fn resolve_channel_metadata(
        &self,
        url: &str,
    ) -> Result<Option<ChannelMetadata>, AdapterError> {
        let extra = ["--flat-playlist", "--playlist-end", "1"].map(String::from);
        let dumped: Option<DumpedChannel> = self.dump(&extra, url).await?;
        Ok(dumped.map(|c| ChannelMetadata {
            channel_id: c.channel_id,
            title: c.title,
            description: c.description,
            follower_count: c.channel_follower_count,
            item_count: c.playlist_count,
            view_count: c.view_count,
            thumbnails: c.thumbnails,
        }))
    }

    async fn list_channel_item_ids(
        &self,
        channel_id: &str,
        max_items: usize,
    ) -> Result<Vec<String>, AdapterError> {
        if max_items == 0 {
            return Ok(Vec::new());
        }
        let extra = vec![
            "--flat-playlist".to_string(),
            "--playlist-end".to_string(),
            max_items.to_string(),
        ];
        let playlist: DumpedPlaylist = self.dump(&extra, &channel_items_url(channel_id)).await?;
        Ok(playlist
            .entries
            .into_iter()
            .flatten()
            .filter_map(|entry| entry.id)
            .take(max_items)
            .collect())
    }

    async fn extract_item_metadata(
        &self,
        url: &str,
    ) -> Result<Option<ItemMetadata>, AdapterError> {
        let extra = ["--no-playlist"].map(String::from);
        let dumped: Option<DumpedVideo> = self.dump(&extra, url).await?;
        Ok(dumped.map(|v| ItemMetadata {
            item_id: v.id,
            title: v.title,
            description: v.description,
            duration: duration_string(v.duration),
            view_count: v.view_count,
            like_count: v.like_count,
            comment_count: v.comment_count,
            upload_date: v.upload_date,
            thumbnails: v.thumbnails,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn video_dump_maps_numeric_duration_and_raw_date() {
        let raw = r#"{
            "id": "abc123",
            "title": "A talk",
            "duration": 213,
            "view_count": 1000,
            "like_count": null,
            "upload_date": "20240105",
            "thumbnails": [{"url": "https://i.ytimg.com/a.jpg", "width": 480, "height": 360, "id": "3"}],
            "formats": []
        }"#;
        let video: DumpedVideo = serde_json::from_str(raw).unwrap();
        assert_eq!(duration_string(video.duration).as_deref(), Some("213"));
        assert_eq!(video.upload_date.as_deref(), Some("20240105"));
        assert_eq!(video.thumbnails[0].width, Some(480));
        assert_eq!(video.like_count, None);
    }

    #[test]
    fn flat_playlist_skips_null_entries() {
        let raw = r#"{"entries": [{"id": "a"}, null, {"id": "b"}, {"title": "no id"}]}"#;
        let playlist: DumpedPlaylist = serde_json::from_str(raw).unwrap();
        let ids: Vec<_> = playlist
            .entries
            .into_iter()
            .flatten()
            .filter_map(|e| e.id)
            .collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn missing_binary_surfaces_as_io_error() {
        let extractor = YtDlpExtractor::new("/nonexistent/yt-dlp", Duration::from_secs(5));
        let err = extractor
            .extract_item_metadata("https://www.youtube.com/watch?v=abc")
            .await
            .unwrap_err();
        assert!(matches!(err, AdapterError::Io(_)));
    }
}
