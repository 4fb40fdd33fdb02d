//! Core domain model, metadata contract and identifier helpers for tubecrawl.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "tubecrawl-core";

pub const TITLE_MAX_CHARS: usize = 500;
pub const DESCRIPTION_MAX_CHARS: usize = 5000;

const ITEM_URL_MARKERS: [&str; 3] = ["youtube.com/watch?v=", "youtu.be/", "youtube.com/embed/"];
const CHANNEL_URL_MARKERS: [&str; 4] = [
    "youtube.com/channel/",
    "youtube.com/c/",
    "youtube.com/user/",
    "youtube.com/@",
];

/// Candidate thumbnail as reported by an extractor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Thumbnail {
    pub url: String,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
}

impl Thumbnail {
    fn area(&self) -> u64 {
        u64::from(self.width.unwrap_or(0)) * u64::from(self.height.unwrap_or(0))
    }
}

/// Lightweight channel metadata handed from the extraction port into the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ChannelMetadata {
    #[serde(default)]
    pub channel_id: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub follower_count: Option<i64>,
    #[serde(default)]
    pub item_count: Option<i64>,
    #[serde(default)]
    pub view_count: Option<i64>,
    #[serde(default)]
    pub thumbnails: Vec<Thumbnail>,
}

/// Per-item metadata handed from the extraction port into the fetch worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ItemMetadata {
    #[serde(default)]
    pub item_id: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub duration: Option<String>,
    #[serde(default)]
    pub view_count: Option<i64>,
    #[serde(default)]
    pub like_count: Option<i64>,
    #[serde(default)]
    pub comment_count: Option<i64>,
    /// Raw publication date, `YYYYMMDD` or RFC 3339 depending on the extractor.
    #[serde(default)]
    pub upload_date: Option<String>,
    #[serde(default)]
    pub thumbnails: Vec<Thumbnail>,
}

/// Persisted channel keyed by its natural identifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    pub channel_id: String,
    pub source_url: String,
    pub title: String,
    pub description: String,
    pub subscriber_count: Option<i64>,
    pub video_count: Option<i64>,
    pub view_count: Option<i64>,
    pub thumbnail_url: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Normalized channel fields ready for an upsert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelDraft {
    pub channel_id: String,
    pub source_url: String,
    pub title: Option<String>,
    pub description: String,
    pub subscriber_count: Option<i64>,
    pub video_count: Option<i64>,
    pub view_count: Option<i64>,
    pub thumbnail_url: String,
}

impl ChannelDraft {
    pub fn from_metadata(channel_id: String, source_url: &str, meta: &ChannelMetadata) -> Self {
        Self {
            channel_id,
            source_url: source_url.to_string(),
            title: meta.title.clone(),
            description: truncate_chars(
                meta.description.as_deref().unwrap_or_default(),
                DESCRIPTION_MAX_CHARS,
            ),
            subscriber_count: meta.follower_count,
            video_count: meta.item_count,
            view_count: meta.view_count,
            thumbnail_url: best_thumbnail(&meta.thumbnails),
        }
    }

    /// First sighting: every available field is written.
    pub fn into_channel(self, now: DateTime<Utc>) -> Channel {
        Channel {
            channel_id: self.channel_id,
            source_url: self.source_url,
            title: self.title.unwrap_or_default(),
            description: self.description,
            subscriber_count: self.subscriber_count,
            video_count: self.video_count,
            view_count: self.view_count,
            thumbnail_url: self.thumbnail_url,
            created_at: now,
            updated_at: now,
        }
    }

    /// Re-resolution: only the mutable fields move, identity and creation time stay.
    /// A missing title keeps the stored one; the subscriber count always takes
    /// the latest reading, including "hidden" (`None`).
    pub fn refresh(&self, channel: &mut Channel, now: DateTime<Utc>) {
        if let Some(title) = &self.title {
            channel.title = title.clone();
        }
        channel.subscriber_count = self.subscriber_count;
        channel.updated_at = now;
    }
}

/// Persisted item. Created once per natural identifier and never updated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    pub item_id: String,
    pub channel_id: String,
    pub title: String,
    pub description: String,
    pub duration: String,
    pub view_count: Option<i64>,
    pub like_count: Option<i64>,
    pub comment_count: Option<i64>,
    pub upload_date: Option<DateTime<Utc>>,
    pub thumbnail_url: String,
    pub item_url: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemDraft {
    pub item_id: String,
    pub channel_id: String,
    pub title: String,
    pub description: String,
    pub duration: String,
    pub view_count: Option<i64>,
    pub like_count: Option<i64>,
    pub comment_count: Option<i64>,
    pub upload_date: Option<DateTime<Utc>>,
    pub thumbnail_url: String,
    pub item_url: String,
}

impl ItemDraft {
    pub fn from_metadata(item_id: String, channel_id: &str, item_url: &str, meta: &ItemMetadata) -> Self {
        Self {
            item_id,
            channel_id: channel_id.to_string(),
            title: truncate_chars(meta.title.as_deref().unwrap_or_default(), TITLE_MAX_CHARS),
            description: truncate_chars(
                meta.description.as_deref().unwrap_or_default(),
                DESCRIPTION_MAX_CHARS,
            ),
            duration: meta.duration.clone().unwrap_or_default(),
            view_count: meta.view_count,
            like_count: meta.like_count,
            comment_count: meta.comment_count,
            upload_date: meta.upload_date.as_deref().and_then(parse_upload_date),
            thumbnail_url: best_thumbnail(&meta.thumbnails),
            item_url: item_url.to_string(),
        }
    }

    pub fn into_item(self, now: DateTime<Utc>) -> Item {
        Item {
            item_id: self.item_id,
            channel_id: self.channel_id,
            title: self.title,
            description: self.description,
            duration: self.duration,
            view_count: self.view_count,
            like_count: self.like_count,
            comment_count: self.comment_count,
            upload_date: self.upload_date,
            thumbnail_url: self.thumbnail_url,
            item_url: self.item_url,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl TaskStatus {
    /// `Failed -> Processing` is reserved for orchestrator-level retry re-entry.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Processing)
                | (Self::Processing, Self::Completed)
                | (Self::Processing, Self::Failed)
                | (Self::Failed, Self::Processing)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("invalid task status: {s}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("task {task_token}: illegal status transition {from} -> {to}")]
pub struct InvalidTransition {
    pub task_token: String,
    pub from: TaskStatus,
    pub to: TaskStatus,
}

/// Crawl task record. Created by the caller before the pipeline runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrawlTask {
    pub task_token: String,
    pub source_url: String,
    pub channel_id: Option<String>,
    pub status: TaskStatus,
    pub error_message: Option<String>,
    pub items_scraped: u32,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl CrawlTask {
    pub fn new(task_token: impl Into<String>, source_url: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            task_token: task_token.into(),
            source_url: source_url.into(),
            channel_id: None,
            status: TaskStatus::Pending,
            error_message: None,
            items_scraped: 0,
            attempts: 0,
            created_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn transition(&mut self, next: TaskStatus) -> Result<(), InvalidTransition> {
        if !self.status.can_transition_to(next) {
            return Err(InvalidTransition {
                task_token: self.task_token.clone(),
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }

    /// No further run may start: completed, or failed with every retry spent.
    /// `attempts` counts runs, so `max_retries` permits `max_retries + 1` of them.
    pub fn is_terminal(&self, max_retries: u32) -> bool {
        match self.status {
            TaskStatus::Completed => true,
            TaskStatus::Failed => self.attempts > max_retries,
            TaskStatus::Pending | TaskStatus::Processing => false,
        }
    }
}

pub fn new_task_token() -> String {
    Uuid::new_v4().to_string()
}

fn is_id_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '-'
}

fn id_after_marker(url: &str, marker: &str) -> Option<String> {
    let start = url.find(marker)? + marker.len();
    let id: String = url[start..].chars().take_while(|c| is_id_char(*c)).collect();
    (!id.is_empty()).then_some(id)
}

/// Natural item identifier from a watch, short or embed URL.
pub fn item_id_from_url(url: &str) -> Option<String> {
    ITEM_URL_MARKERS
        .iter()
        .find_map(|marker| id_after_marker(url, marker))
}

/// Channel identifier from a channel-by-id, custom-name, legacy-username or
/// handle URL. Unrecognized shapes fall back to the last path segment.
pub fn channel_id_from_url(url: &str) -> String {
    CHANNEL_URL_MARKERS
        .iter()
        .find_map(|marker| id_after_marker(url, marker))
        .unwrap_or_else(|| url.rsplit('/').next().unwrap_or_default().to_string())
}

pub fn item_url(item_id: &str) -> String {
    format!("https://www.youtube.com/watch?v={item_id}")
}

pub fn channel_items_url(channel_id: &str) -> String {
    format!("https://www.youtube.com/channel/{channel_id}/videos")
}

/// Largest thumbnail by pixel area; the first one wins ties. Empty input gives "".
pub fn best_thumbnail(thumbnails: &[Thumbnail]) -> String {
    let mut best: Option<&Thumbnail> = None;
    for thumb in thumbnails {
        if best.map_or(true, |b| thumb.area() > b.area()) {
            best = Some(thumb);
        }
    }
    best.map(|t| t.url.clone()).unwrap_or_default()
}

pub fn truncate_chars(input: &str, max_chars: usize) -> String {
    match input.char_indices().nth(max_chars) {
        Some((idx, _)) => input[..idx].to_string(),
        None => input.to_string(),
    }
}

/// Accepts `YYYYMMDD` or RFC 3339. Anything else is treated as unknown.
pub fn parse_upload_date(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y%m%d") {
        return date.and_hms_opt(0, 0, 0).map(|dt| dt.and_utc());
    }
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn thumb(url: &str, w: u32, h: u32) -> Thumbnail {
        Thumbnail {
            url: url.to_string(),
            width: Some(w),
            height: Some(h),
        }
    }

    #[test]
    fn item_ids_come_from_all_supported_url_shapes() {
        assert_eq!(
            item_id_from_url("https://www.youtube.com/watch?v=dQw4w9WgXcQ&t=10").as_deref(),
            Some("dQw4w9WgXcQ")
        );
        assert_eq!(item_id_from_url("https://youtu.be/abc_DEF-123").as_deref(), Some("abc_DEF-123"));
        assert_eq!(
            item_id_from_url("https://www.youtube.com/embed/XyZ?autoplay=1").as_deref(),
            Some("XyZ")
        );
        assert_eq!(item_id_from_url("https://example.com/video/1"), None);
        assert_eq!(item_id_from_url("https://www.youtube.com/watch?v="), None);
    }

    #[test]
    fn channel_ids_cover_id_handle_custom_and_user_shapes() {
        assert_eq!(
            channel_id_from_url("https://www.youtube.com/channel/UC_x5XG1OV2P6uZZ5FSM9Ttw"),
            "UC_x5XG1OV2P6uZZ5FSM9Ttw"
        );
        assert_eq!(channel_id_from_url("https://www.youtube.com/@GoogleDevelopers/videos"), "GoogleDevelopers");
        assert_eq!(channel_id_from_url("https://youtube.com/c/SomeName"), "SomeName");
        assert_eq!(channel_id_from_url("https://youtube.com/user/legacyname"), "legacyname");
        assert_eq!(channel_id_from_url("https://vimeo.com/people/last-bit"), "last-bit");
    }

    #[test]
    fn best_thumbnail_maximizes_area_and_keeps_first_on_ties() {
        let thumbs = vec![
            thumb("small", 120, 90),
            thumb("big-a", 1280, 720),
            thumb("big-b", 720, 1280),
            Thumbnail {
                url: "unsized".into(),
                width: None,
                height: None,
            },
        ];
        assert_eq!(best_thumbnail(&thumbs), "big-a");
        assert_eq!(best_thumbnail(&[]), "");
    }

    #[test]
    fn upload_dates_parse_or_become_none() {
        assert_eq!(
            parse_upload_date("20240131"),
            Some(Utc.with_ymd_and_hms(2024, 1, 31, 0, 0, 0).unwrap())
        );
        assert_eq!(
            parse_upload_date("2024-01-31T10:00:00Z"),
            Some(Utc.with_ymd_and_hms(2024, 1, 31, 10, 0, 0).unwrap())
        );
        assert_eq!(parse_upload_date("not a date"), None);
        assert_eq!(parse_upload_date("20241399"), None);
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("short", 50), "short");
    }

    #[test]
    fn status_machine_only_allows_forward_moves_and_retry_reentry() {
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let mut task = CrawlTask::new("t-1", "https://youtube.com/@x", now);
        assert!(task.transition(TaskStatus::Completed).is_err());
        task.transition(TaskStatus::Processing).unwrap();
        task.transition(TaskStatus::Failed).unwrap();
        task.transition(TaskStatus::Processing).unwrap();
        task.transition(TaskStatus::Completed).unwrap();
        let err = task.transition(TaskStatus::Processing).unwrap_err();
        assert_eq!(err.from, TaskStatus::Completed);
        assert!(task.is_terminal(3));
    }

    #[test]
    fn failed_task_is_terminal_once_retries_are_spent() {
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let mut task = CrawlTask::new("t-1", "https://youtube.com/@x", now);
        assert!(!task.is_terminal(3));
        task.transition(TaskStatus::Processing).unwrap();
        task.transition(TaskStatus::Failed).unwrap();
        task.attempts = 3;
        assert!(!task.is_terminal(3));
        task.attempts = 4;
        assert!(task.is_terminal(3));
        assert!(task.is_terminal(0) && !task.is_terminal(4));
    }

    #[test]
    fn status_round_trips_through_its_string_form() {
        for status in [
            TaskStatus::Pending,
            TaskStatus::Processing,
            TaskStatus::Completed,
            TaskStatus::Failed,
        ] {
            assert_eq!(status.to_string().parse::<TaskStatus>().unwrap(), status);
        }
        assert_eq!(
            serde_json::to_string(&TaskStatus::Processing).unwrap(),
            "\"processing\""
        );
    }

    #[test]
    fn channel_refresh_keeps_identity_and_creation_time() {
        let t0 = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let t1 = Utc.with_ymd_and_hms(2026, 1, 2, 0, 0, 0).unwrap();
        let first = ChannelDraft::from_metadata(
            "UC1".into(),
            "https://youtube.com/channel/UC1",
            &ChannelMetadata {
                title: Some("Old".into()),
                follower_count: Some(10),
                item_count: Some(4),
                ..Default::default()
            },
        );
        let mut channel = first.into_channel(t0);

        let second = ChannelDraft::from_metadata(
            "UC1".into(),
            "https://youtube.com/channel/UC1",
            &ChannelMetadata {
                title: Some("New".into()),
                follower_count: Some(25),
                item_count: Some(99),
                ..Default::default()
            },
        );
        second.refresh(&mut channel, t1);

        assert_eq!(channel.channel_id, "UC1");
        assert_eq!(channel.created_at, t0);
        assert_eq!(channel.updated_at, t1);
        assert_eq!(channel.title, "New");
        assert_eq!(channel.subscriber_count, Some(25));
        assert_eq!(channel.video_count, Some(4));
    }

    #[test]
    fn hidden_subscriber_count_replaces_the_stale_one() {
        let t0 = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let mut channel = ChannelDraft::from_metadata(
            "UC1".into(),
            "https://youtube.com/channel/UC1",
            &ChannelMetadata {
                title: Some("Shown".into()),
                follower_count: Some(10),
                ..Default::default()
            },
        )
        .into_channel(t0);

        let hidden = ChannelDraft::from_metadata(
            "UC1".into(),
            "https://youtube.com/channel/UC1",
            &ChannelMetadata::default(),
        );
        hidden.refresh(&mut channel, t0);

        assert_eq!(channel.subscriber_count, None);
        assert_eq!(channel.title, "Shown");
    }
}
