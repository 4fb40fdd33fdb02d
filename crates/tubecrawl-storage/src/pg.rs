//! Postgres-backed store. Per-key atomicity is delegated to `ON CONFLICT` clauses.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tubecrawl_core::{Channel, ChannelDraft, CrawlTask, Item, ItemDraft, TaskStatus};

use crate::{ChannelUpsert, CrawlStore, ItemInsert};

const CHANNEL_COLUMNS: &str = "channel_id, source_url, title, description, subscriber_count, \
    video_count, view_count, thumbnail_url, created_at, updated_at";
const ITEM_COLUMNS: &str = "item_id, channel_id, title, description, duration, view_count, \
    like_count, comment_count, upload_date, thumbnail_url, item_url, created_at, updated_at";
const TASK_COLUMNS: &str = "task_token, source_url, channel_id, status, error_message, \
    items_scraped, attempts, created_at, started_at, completed_at";

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(database_url)
            .await
            .context("connecting to postgres")?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .context("running migrations")
    }
}

fn channel_from_row(row: &PgRow) -> Result<Channel> {
    Ok(Channel {
        channel_id: row.try_get("channel_id")?,
        source_url: row.try_get("source_url")?,
        title: row.try_get("title")?,
        description: row.try_get("description")?,
        subscriber_count: row.try_get("subscriber_count")?,
        video_count: row.try_get("video_count")?,
        view_count: row.try_get("view_count")?,
        thumbnail_url: row.try_get("thumbnail_url")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn item_from_row(row: &PgRow) -> Result<Item> {
    Ok(Item {
        item_id: row.try_get("item_id")?,
        channel_id: row.try_get("channel_id")?,
        title: row.try_get("title")?,
        description: row.try_get("description")?,
        duration: row.try_get("duration")?,
        view_count: row.try_get("view_count")?,
        like_count: row.try_get("like_count")?,
        comment_count: row.try_get("comment_count")?,
        upload_date: row.try_get("upload_date")?,
        thumbnail_url: row.try_get("thumbnail_url")?,
        item_url: row.try_get("item_url")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn task_from_row(row: &PgRow) -> Result<CrawlTask> {
    let status: String = row.try_get("status")?;
    let items_scraped: i32 = row.try_get("items_scraped")?;
    let attempts: i32 = row.try_get("attempts")?;
    Ok(CrawlTask {
        task_token: row.try_get("task_token")?,
        source_url: row.try_get("source_url")?,
        channel_id: row.try_get("channel_id")?,
        status: status.parse::<TaskStatus>().map_err(|e| anyhow!(e))?,
        error_message: row.try_get("error_message")?,
        items_scraped: u32::try_from(items_scraped).unwrap_or_default(),
        attempts: u32::try_from(attempts).unwrap_or_default(),
        created_at: row.try_get("created_at")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
    })
}

#[async_trait]
impl CrawlStore for PgStore {
    async fn upsert_channel(&self, draft: ChannelDraft) -> Result<ChannelUpsert> {
        let sql = format!(
            "INSERT INTO channels ({CHANNEL_COLUMNS}) \
             VALUES ($1, $2, COALESCE($3, ''), $4, $5, $6, $7, $8, $9, $9) \
             ON CONFLICT (channel_id) DO UPDATE SET \
                 title = COALESCE($3, channels.title), \
                 subscriber_count = $5, \
                 updated_at = $9 \
             RETURNING {CHANNEL_COLUMNS}, (xmax = 0) AS created"
        );
        let row = sqlx::query(&sql)
            .bind(&draft.channel_id)
            .bind(&draft.source_url)
            .bind(&draft.title)
            .bind(&draft.description)
            .bind(draft.subscriber_count)
            .bind(draft.video_count)
            .bind(draft.view_count)
            .bind(&draft.thumbnail_url)
            .bind(Utc::now())
            .fetch_one(&self.pool)
            .await
            .with_context(|| format!("upserting channel {}", draft.channel_id))?;
        Ok(ChannelUpsert {
            channel: channel_from_row(&row)?,
            created: row.try_get("created")?,
        })
    }

    async fn get_channel(&self, channel_id: &str) -> Result<Option<Channel>> {
        let sql = format!("SELECT {CHANNEL_COLUMNS} FROM channels WHERE channel_id = $1");
        let row = sqlx::query(&sql)
            .bind(channel_id)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("loading channel {channel_id}"))?;
        row.as_ref().map(channel_from_row).transpose()
    }

    async fn item_exists(&self, item_id: &str) -> Result<bool> {
        let exists: bool = sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM items WHERE item_id = $1)")
            .bind(item_id)
            .fetch_one(&self.pool)
            .await
            .with_context(|| format!("checking item {item_id}"))?;
        Ok(exists)
    }

    async fn get_or_create_item(&self, draft: ItemDraft) -> Result<ItemInsert> {
        let now = Utc::now();
        let sql = format!(
            "INSERT INTO items ({ITEM_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $12) \
             ON CONFLICT (item_id) DO NOTHING \
             RETURNING {ITEM_COLUMNS}"
        );
        let inserted = sqlx::query(&sql)
            .bind(&draft.item_id)
            .bind(&draft.channel_id)
            .bind(&draft.title)
            .bind(&draft.description)
            .bind(&draft.duration)
            .bind(draft.view_count)
            .bind(draft.like_count)
            .bind(draft.comment_count)
            .bind(draft.upload_date)
            .bind(&draft.thumbnail_url)
            .bind(&draft.item_url)
            .bind(now)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("inserting item {}", draft.item_id))?;

        if let Some(row) = inserted {
            return Ok(ItemInsert {
                item: item_from_row(&row)?,
                created: true,
            });
        }

        let sql = format!("SELECT {ITEM_COLUMNS} FROM items WHERE item_id = $1");
        let row = sqlx::query(&sql)
            .bind(&draft.item_id)
            .fetch_one(&self.pool)
            .await
            .with_context(|| format!("loading existing item {}", draft.item_id))?;
        Ok(ItemInsert {
            item: item_from_row(&row)?,
            created: false,
        })
    }

    async fn list_items(&self, channel_id: &str) -> Result<Vec<Item>> {
        let sql = format!(
            "SELECT {ITEM_COLUMNS} FROM items WHERE channel_id = $1 \
             ORDER BY upload_date DESC NULLS LAST"
        );
        let rows = sqlx::query(&sql)
            .bind(channel_id)
            .fetch_all(&self.pool)
            .await
            .with_context(|| format!("listing items for {channel_id}"))?;
        rows.iter().map(item_from_row).collect()
    }

    async fn create_task(&self, task: &CrawlTask) -> Result<()> {
        let sql = format!(
            "INSERT INTO crawl_tasks ({TASK_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)"
        );
        sqlx::query(&sql)
            .bind(&task.task_token)
            .bind(&task.source_url)
            .bind(&task.channel_id)
            .bind(task.status.as_str())
            .bind(&task.error_message)
            .bind(task.items_scraped as i32)
            .bind(task.attempts as i32)
            .bind(task.created_at)
            .bind(task.started_at)
            .bind(task.completed_at)
            .execute(&self.pool)
            .await
            .with_context(|| format!("creating task {}", task.task_token))?;
        Ok(())
    }

    async fn get_task(&self, task_token: &str) -> Result<Option<CrawlTask>> {
        let sql = format!("SELECT {TASK_COLUMNS} FROM crawl_tasks WHERE task_token = $1");
        let row = sqlx::query(&sql)
            .bind(task_token)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("loading task {task_token}"))?;
        row.as_ref().map(task_from_row).transpose()
    }

    async fn save_task(&self, task: &CrawlTask) -> Result<()> {
        sqlx::query(
            "UPDATE crawl_tasks SET channel_id = $2, status = $3, error_message = $4, \
             items_scraped = $5, attempts = $6, started_at = $7, completed_at = $8 \
             WHERE task_token = $1",
        )
        .bind(&task.task_token)
        .bind(&task.channel_id)
        .bind(task.status.as_str())
        .bind(&task.error_message)
        .bind(task.items_scraped as i32)
        .bind(task.attempts as i32)
        .bind(task.started_at)
        .bind(task.completed_at)
        .execute(&self.pool)
        .await
        .with_context(|| format!("saving task {}", task.task_token))?;
        Ok(())
    }
}
