//! Row mapping for the work-queue table.
//!
//! Keep these focused on turning stored columns back into domain types.
//! Queue rules live in the repository and in `crate::queue`.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use uuid::Uuid;

use crate::model::{Platform, ProductionRequest, QueueItem, QueueStatus};

pub const QUEUE_COLUMNS: &str = "id, name, channel_id, format, content_type, script, platforms, status, error, created_at, updated_at";

pub fn queue_item_from_row(row: &SqliteRow) -> Result<QueueItem> {
    let id: String = row.get("id");
    let format: String = row.get("format");
    let content_type: String = row.get("content_type");
    let platforms: String = row.get("platforms");
    let status: String = row.get("status");

    let request = ProductionRequest {
        id: Uuid::parse_str(&id).with_context(|| format!("invalid queue item id {id}"))?,
        name: row.get("name"),
        channel_id: row.get("channel_id"),
        format: format.parse().map_err(|e: String| anyhow!(e))?,
        content_type: content_type.parse().map_err(|e: String| anyhow!(e))?,
        script: row.get("script"),
        platforms: serde_json::from_str::<Vec<Platform>>(&platforms)
            .context("invalid platforms column")?,
        created_at: row.get::<DateTime<Utc>, _>("created_at"),
    };

    Ok(QueueItem {
        request,
        status: QueueStatus::parse(&status)
            .ok_or_else(|| anyhow!("unknown queue status '{status}'"))?,
        error: row.get("error"),
        updated_at: row.get::<DateTime<Utc>, _>("updated_at"),
    })
}
