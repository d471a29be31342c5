use std::time::Duration;

use sqlx::mysql::{MySqlPool, MySqlRow};
use sqlx::Row;

/// One `change_log` row as written by the table triggers
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeLogRow {
    pub id: i64,
    pub table_name: String,
    pub change_kind: String,
    /// JSON object text
    pub row_data: String,
}

const CHANGE_COLUMNS: &str = "id, table_name, change_kind, CAST(row_data AS CHAR) AS row_data";

fn change_from_row(row: &MySqlRow) -> Result<ChangeLogRow, sqlx::Error> {
    Ok(ChangeLogRow {
        id: row.try_get("id")?,
        table_name: row.try_get("table_name")?,
        change_kind: row.try_get("change_kind")?,
        row_data: row.try_get("row_data")?,
    })
}

/// Id of the newest change, 0 when the log is empty
pub async fn get_latest_change_id(pool: &MySqlPool) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar("SELECT CAST(COALESCE(MAX(id), 0) AS SIGNED) FROM change_log")
        .fetch_one(pool)
        .await
}

/// Changes after `after_id` in id order
pub async fn get_changes_after(
    pool: &MySqlPool,
    after_id: i64,
    limit: u32,
) -> Result<Vec<ChangeLogRow>, sqlx::Error> {
    let sql = format!(
        "SELECT {} FROM change_log WHERE id > ? ORDER BY id LIMIT ?",
        CHANGE_COLUMNS
    );
    let rows = sqlx::query(&sql)
        .bind(after_id)
        .bind(limit)
        .fetch_all(pool)
        .await?;

    rows.iter().map(change_from_row).collect()
}

/// Look up specific changes, for ids that were skipped while their writer
/// had not committed yet
pub async fn get_changes_by_ids(
    pool: &MySqlPool,
    ids: &[i64],
) -> Result<Vec<ChangeLogRow>, sqlx::Error> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }

    let placeholders = vec!["?"; ids.len()].join(", ");
    let sql = format!(
        "SELECT {} FROM change_log WHERE id IN ({}) ORDER BY id",
        CHANGE_COLUMNS, placeholders
    );
    let mut query = sqlx::query(&sql);
    for id in ids {
        query = query.bind(*id);
    }

    let rows = query.fetch_all(pool).await?;
    rows.iter().map(change_from_row).collect()
}

/// Delete changes older than `retention`
pub async fn prune_changes(pool: &MySqlPool, retention: Duration) -> Result<u64, sqlx::Error> {
    let result = sqlx::query("DELETE FROM change_log WHERE created_at < NOW(3) - INTERVAL ? SECOND")
        .bind(retention.as_secs() as i64)
        .execute(pool)
        .await?;

    Ok(result.rows_affected())
}
