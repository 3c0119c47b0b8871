use super::model::{queue_item_from_row, QUEUE_COLUMNS};
use crate::model::{ProductionRequest, QueueItem, QueueStatus};
use anyhow::{anyhow, Result};
use chrono::Utc;
use sqlx::SqlitePool;
use tracing::instrument;
use uuid::Uuid;

pub type Pool = SqlitePool;

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let pool = SqlitePool::connect(&normalized).await?;
    if !normalized.starts_with("sqlite::memory") {
        sqlx::query("PRAGMA journal_mode=WAL;")
            .execute(&pool)
            .await?;
    }
    Ok(pool)
}

/// If using a file-backed SQLite URL, expand a leading `~/` and ensure the parent
/// directory exists. Leaves in-memory URLs untouched. Returns possibly-updated URL.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") || url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = &url["sqlite:".len()..];
    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);
    let (path_part, query_part) = match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    };
    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded_path = match (path_part.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(rest), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), rest),
        _ => path_part.to_string(),
    };

    if let Some(parent) = std::path::Path::new(&expanded_path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    // sqlx refuses to create a missing database file unless asked to.
    let mut rebuilt = format!("sqlite://{expanded_path}");
    match query_part {
        Some(q) if q.contains("mode=") => {
            rebuilt.push('?');
            rebuilt.push_str(q);
        }
        Some(q) => {
            rebuilt.push('?');
            rebuilt.push_str(q);
            rebuilt.push_str("&mode=rwc");
        }
        None => rebuilt.push_str("?mode=rwc"),
    }
    rebuilt
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn insert_item(pool: &Pool, req: &ProductionRequest) -> Result<QueueItem> {
    let now = Utc::now();
    let row = sqlx::query(&format!(
        "INSERT INTO queue_items (id, name, channel_id, format, content_type, script, platforms, status, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, 'queued', ?, ?) RETURNING {QUEUE_COLUMNS}"
    ))
    .bind(req.id.to_string())
    .bind(&req.name)
    .bind(&req.channel_id)
    .bind(req.format.as_str())
    .bind(req.content_type.as_str())
    .bind(&req.script)
    .bind(serde_json::to_string(&req.platforms)?)
    .bind(req.created_at)
    .bind(now)
    .fetch_one(pool)
    .await?;
    queue_item_from_row(&row)
}

/// Delete an item unless it is currently processing. Returns whether a row went away.
#[instrument(skip_all)]
pub async fn delete_item(pool: &Pool, id: Uuid) -> Result<bool> {
    let res = sqlx::query("DELETE FROM queue_items WHERE id = ? AND status != 'processing'")
        .bind(id.to_string())
        .execute(pool)
        .await?;
    Ok(res.rows_affected() > 0)
}

#[instrument(skip_all)]
pub async fn get_item(pool: &Pool, id: Uuid) -> Result<Option<QueueItem>> {
    let row = sqlx::query(&format!(
        "SELECT {QUEUE_COLUMNS} FROM queue_items WHERE id = ?"
    ))
    .bind(id.to_string())
    .fetch_optional(pool)
    .await?;
    row.as_ref().map(queue_item_from_row).transpose()
}

#[instrument(skip_all)]
pub async fn list_items(pool: &Pool) -> Result<Vec<QueueItem>> {
    let rows = sqlx::query(&format!(
        "SELECT {QUEUE_COLUMNS} FROM queue_items ORDER BY seq ASC"
    ))
    .fetch_all(pool)
    .await?;
    rows.iter().map(queue_item_from_row).collect()
}

/// Oldest queued item, without claiming it.
#[instrument(skip_all)]
pub async fn next_queued(pool: &Pool) -> Result<Option<QueueItem>> {
    let row = sqlx::query(&format!(
        "SELECT {QUEUE_COLUMNS} FROM queue_items WHERE status = 'queued' ORDER BY seq ASC LIMIT 1"
    ))
    .fetch_optional(pool)
    .await?;
    row.as_ref().map(queue_item_from_row).transpose()
}

/// Atomically move the oldest queued item to `processing`. Nothing is claimed
/// while another item is already processing.
#[instrument(skip_all)]
pub async fn claim_next(pool: &Pool) -> Result<Option<QueueItem>> {
    let row = sqlx::query(&format!(
        "UPDATE queue_items SET status = 'processing', error = NULL, updated_at = ? \
         WHERE seq = (SELECT seq FROM queue_items WHERE status = 'queued' ORDER BY seq ASC LIMIT 1) \
           AND NOT EXISTS (SELECT 1 FROM queue_items WHERE status = 'processing') \
         RETURNING {QUEUE_COLUMNS}"
    ))
    .bind(Utc::now())
    .fetch_optional(pool)
    .await?;
    row.as_ref().map(queue_item_from_row).transpose()
}

/// Move an item from `from` to `to`, recording `error` (cleared when None).
#[instrument(skip_all)]
pub async fn transition(
    pool: &Pool,
    id: Uuid,
    from: &[QueueStatus],
    to: QueueStatus,
    error: Option<&str>,
) -> Result<()> {
    let placeholders = vec!["?"; from.len()].join(", ");
    let sql = format!(
        "UPDATE queue_items SET status = ?, error = ?, updated_at = ? WHERE id = ? AND status IN ({placeholders})"
    );
    let mut query = sqlx::query(&sql)
        .bind(to.as_str())
        .bind(error)
        .bind(Utc::now())
        .bind(id.to_string());
    for status in from {
        query = query.bind(status.as_str());
    }
    let res = query.execute(pool).await?;
    if res.rows_affected() == 0 {
        return Err(anyhow!("queue item {id} cannot move to {to}"));
    }
    Ok(())
}

/// Return items left `processing` by an earlier session to the queue.
#[instrument(skip_all)]
pub async fn requeue_stale(pool: &Pool) -> Result<u64> {
    let res = sqlx::query(
        "UPDATE queue_items SET status = 'queued', updated_at = ? WHERE status = 'processing'",
    )
    .bind(Utc::now())
    .execute(pool)
    .await?;
    Ok(res.rows_affected())
}

pub async fn count_with_status(pool: &Pool, status: QueueStatus) -> Result<i64> {
    let cnt: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM queue_items WHERE status = ?")
        .bind(status.as_str())
        .fetch_one(pool)
        .await?;
    Ok(cnt)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ContentType, Platform, VideoFormat};

    async fn setup_pool() -> Pool {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        pool
    }

    fn request(name: &str) -> ProductionRequest {
        ProductionRequest::new(
            name,
            "chan-1",
            VideoFormat::Short,
            ContentType::Story,
            "Once upon a time",
        )
    }

    #[tokio::test]
    async fn claim_takes_oldest_and_blocks_second_claim() {
        let pool = setup_pool().await;
        let first = insert_item(&pool, &request("first")).await.unwrap();
        let _second = insert_item(&pool, &request("second")).await.unwrap();

        let claimed = claim_next(&pool).await.unwrap().unwrap();
        assert_eq!(claimed.request.id, first.request.id);
        assert_eq!(claimed.status, QueueStatus::Processing);

        // One item processing: nothing else may be claimed.
        assert!(claim_next(&pool).await.unwrap().is_none());
        assert_eq!(count_with_status(&pool, QueueStatus::Processing).await.unwrap(), 1);

        transition(
            &pool,
            first.request.id,
            &[QueueStatus::Processing],
            QueueStatus::Done,
            None,
        )
        .await
        .unwrap();
        let next = claim_next(&pool).await.unwrap().unwrap();
        assert_eq!(next.request.name, "second");
    }

    #[tokio::test]
    async fn round_trips_request_fields() {
        let pool = setup_pool().await;
        let req = request("doc").with_platforms(vec![Platform::Youtube, Platform::Tiktok]);
        insert_item(&pool, &req).await.unwrap();
        let stored = get_item(&pool, req.id).await.unwrap().unwrap();
        assert_eq!(stored.request.platforms, req.platforms);
        assert_eq!(stored.request.script, req.script);
        assert_eq!(stored.status, QueueStatus::Queued);
        assert!(stored.error.is_none());
    }

    #[tokio::test]
    async fn invalid_transition_is_rejected() {
        let pool = setup_pool().await;
        let item = insert_item(&pool, &request("x")).await.unwrap();
        let err = transition(
            &pool,
            item.request.id,
            &[QueueStatus::Processing],
            QueueStatus::Done,
            None,
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("cannot move to done"));
    }

    #[tokio::test]
    async fn processing_items_cannot_be_deleted_and_stale_ones_requeue() {
        let pool = setup_pool().await;
        let item = insert_item(&pool, &request("x")).await.unwrap();
        claim_next(&pool).await.unwrap().unwrap();
        assert!(!delete_item(&pool, item.request.id).await.unwrap());

        assert_eq!(requeue_stale(&pool).await.unwrap(), 1);
        assert!(next_queued(&pool).await.unwrap().is_some());
        assert!(delete_item(&pool, item.request.id).await.unwrap());
        assert!(list_items(&pool).await.unwrap().is_empty());
    }

    #[test]
    fn prepare_sqlite_url_adds_create_mode() {
        assert_eq!(prepare_sqlite_url("sqlite::memory:"), "sqlite::memory:");
        let td = tempfile::tempdir().unwrap();
        let path = td.path().join("nested").join("q.db");
        let url = prepare_sqlite_url(&format!("sqlite://{}", path.display()));
        assert!(url.ends_with("q.db?mode=rwc"));
        assert!(path.parent().unwrap().exists());
    }
}
