use sqlx::mysql::{MySqlPool, MySqlRow};
use sqlx::Row;

use super::{RequestQuery, StatusChange};
use crate::models::{NewRequest, TransactionRequest};

const REQUEST_COLUMNS: &str =
    "id, user_id, amount, kind, external_reference, status, created_at, \
     acted_by, acted_at, rejection_reason";

fn request_from_row(row: &MySqlRow) -> Result<TransactionRequest, sqlx::Error> {
    let kind: String = row.try_get("kind")?;
    let status: String = row.try_get("status")?;

    Ok(TransactionRequest {
        id: row.try_get("id")?,
        member_id: row.try_get("user_id")?,
        amount: row.try_get("amount")?,
        kind: kind.parse().map_err(|e: String| sqlx::Error::Decode(e.into()))?,
        external_reference: row.try_get("external_reference")?,
        status: status.parse().map_err(|e: String| sqlx::Error::Decode(e.into()))?,
        created_at: row.try_get("created_at")?,
        acted_by: row.try_get("acted_by")?,
        acted_at: row.try_get("acted_at")?,
        rejection_reason: row.try_get("rejection_reason")?,
    })
}

/// Create a new pending request, returning its id
pub async fn create_request(pool: &MySqlPool, new: &NewRequest) -> Result<i64, sqlx::Error> {
    let result = sqlx::query(
        "INSERT INTO transaction_requests (user_id, amount, kind, external_reference, status) \
         VALUES (?, ?, ?, ?, 'pending')"
    )
    .bind(new.member_id)
    .bind(new.amount)
    .bind(new.kind.as_str())
    .bind(new.external_reference.as_deref())
    .execute(pool)
    .await?;

    Ok(result.last_insert_id() as i64)
}

/// Get request by ID
pub async fn get_request(
    pool: &MySqlPool,
    request_id: i64,
) -> Result<Option<TransactionRequest>, sqlx::Error> {
    let sql = format!("SELECT {} FROM transaction_requests WHERE id = ?", REQUEST_COLUMNS);
    let row = sqlx::query(&sql)
        .bind(request_id)
        .fetch_optional(pool)
        .await?;

    row.as_ref().map(request_from_row).transpose()
}

/// Get requests matching the query, newest first
pub async fn list_requests(
    pool: &MySqlPool,
    query: &RequestQuery,
) -> Result<Vec<TransactionRequest>, sqlx::Error> {
    let mut sql = format!("SELECT {} FROM transaction_requests WHERE 1 = 1", REQUEST_COLUMNS);
    if query.member_id.is_some() {
        sql.push_str(" AND user_id = ?");
    }
    if query.status.is_some() {
        sql.push_str(" AND status = ?");
    }
    sql.push_str(" ORDER BY created_at DESC, id DESC");
    if query.limit.is_some() {
        sql.push_str(" LIMIT ?");
    }

    let mut q = sqlx::query(&sql);
    if let Some(member_id) = query.member_id {
        q = q.bind(member_id);
    }
    if let Some(status) = query.status {
        q = q.bind(status.as_str());
    }
    if let Some(limit) = query.limit {
        q = q.bind(limit as i64);
    }

    let rows = q.fetch_all(pool).await?;
    rows.iter().map(request_from_row).collect()
}

/// Set the declared reference while the request is still pending
pub async fn set_external_reference(
    pool: &MySqlPool,
    request_id: i64,
    reference: &str,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE transaction_requests SET external_reference = ? WHERE id = ? AND status = 'pending'"
    )
    .bind(reference)
    .bind(request_id)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Delete a pending request that has no proof row
pub async fn delete_pending_request(
    pool: &MySqlPool,
    request_id: i64,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        "DELETE FROM transaction_requests WHERE id = ? AND status = 'pending' \
         AND NOT EXISTS (SELECT 1 FROM transaction_proofs p WHERE p.request_id = ?)"
    )
    .bind(request_id)
    .bind(request_id)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Compare-and-set status update. Returns false if the status had already moved.
pub async fn update_status(pool: &MySqlPool, change: &StatusChange) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE transaction_requests \
         SET status = ?, acted_by = ?, acted_at = ?, rejection_reason = ? \
         WHERE id = ? AND status = ?"
    )
    .bind(change.to.as_str())
    .bind(change.actor_id)
    .bind(change.at)
    .bind(change.reason.as_deref())
    .bind(change.request_id)
    .bind(change.from.as_str())
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}
