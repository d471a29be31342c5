use sqlx::mysql::{MySqlPool, MySqlRow};
use sqlx::Row;
use tracing::warn;

use crate::models::{MemberTransaction, NewLedgerEntry, RequestStatus};
use crate::utils::{EngineError, Result};

const ENTRY_COLUMNS: &str = "id, user_id, request_id, amount, direction, balance_after, created_at";

fn entry_from_row(row: &MySqlRow) -> std::result::Result<MemberTransaction, sqlx::Error> {
    let direction: String = row.try_get("direction")?;

    Ok(MemberTransaction {
        id: row.try_get("id")?,
        member_id: row.try_get("user_id")?,
        request_id: row.try_get("request_id")?,
        amount: row.try_get("amount")?,
        direction: direction.parse().map_err(|e: String| sqlx::Error::Decode(e.into()))?,
        balance_after: row.try_get("balance_after")?,
        created_at: row.try_get("created_at")?,
    })
}

/// Get the most recent ledger entry for a member
pub async fn get_latest_entry(
    pool: &MySqlPool,
    member_id: i64,
) -> std::result::Result<Option<MemberTransaction>, sqlx::Error> {
    let sql = format!(
        "SELECT {} FROM member_transactions WHERE user_id = ? \
         ORDER BY created_at DESC, id DESC LIMIT 1",
        ENTRY_COLUMNS
    );
    let row = sqlx::query(&sql)
        .bind(member_id)
        .fetch_optional(pool)
        .await?;

    row.as_ref().map(entry_from_row).transpose()
}

/// Get the ledger entry posted for a request, if any
pub async fn get_entry_by_request(
    pool: &MySqlPool,
    request_id: i64,
) -> std::result::Result<Option<MemberTransaction>, sqlx::Error> {
    let sql = format!("SELECT {} FROM member_transactions WHERE request_id = ?", ENTRY_COLUMNS);
    let row = sqlx::query(&sql)
        .bind(request_id)
        .fetch_optional(pool)
        .await?;

    row.as_ref().map(entry_from_row).transpose()
}

/// Get all ledger entries for a member, oldest first
pub async fn get_member_entries(
    pool: &MySqlPool,
    member_id: i64,
) -> std::result::Result<Vec<MemberTransaction>, sqlx::Error> {
    let sql = format!(
        "SELECT {} FROM member_transactions WHERE user_id = ? ORDER BY created_at ASC, id ASC",
        ENTRY_COLUMNS
    );
    let rows = sqlx::query(&sql)
        .bind(member_id)
        .fetch_all(pool)
        .await?;

    rows.iter().map(entry_from_row).collect()
}

/// Append a ledger entry and mark its request posted
/// ATOMIC: member row lock, idempotency check, prior-entry check, status update and
/// insert all happen in one transaction
pub async fn append_entry(
    pool: &MySqlPool,
    entry: &NewLedgerEntry,
) -> Result<MemberTransaction> {
    let mut tx = pool.begin().await?;

    // Serialize writers for this member across processes
    sqlx::query("SELECT id FROM users WHERE id = ? FOR UPDATE")
        .bind(entry.member_id)
        .fetch_optional(&mut *tx)
        .await?;

    let existing: Option<i64> =
        sqlx::query_scalar("SELECT id FROM member_transactions WHERE request_id = ?")
            .bind(entry.request_id)
            .fetch_optional(&mut *tx)
            .await?;
    if let Some(entry_id) = existing {
        tx.rollback().await?;
        return Err(EngineError::DuplicatePosting {
            request_id: entry.request_id,
            entry_id,
        });
    }

    let latest: Option<i64> = sqlx::query_scalar(
        "SELECT id FROM member_transactions WHERE user_id = ? \
         ORDER BY created_at DESC, id DESC LIMIT 1 FOR UPDATE"
    )
    .bind(entry.member_id)
    .fetch_optional(&mut *tx)
    .await?;
    if latest != entry.prior_entry_id {
        tx.rollback().await?;
        return Err(EngineError::StaleBalance {
            member_id: entry.member_id,
        });
    }

    let moved = sqlx::query(
        "UPDATE transaction_requests SET status = 'posted' WHERE id = ? AND status = 'verified'"
    )
    .bind(entry.request_id)
    .execute(&mut *tx)
    .await?
    .rows_affected();
    if moved == 0 {
        let current: Option<String> =
            sqlx::query_scalar("SELECT status FROM transaction_requests WHERE id = ?")
                .bind(entry.request_id)
                .fetch_optional(&mut *tx)
                .await?;
        tx.rollback().await?;

        let current = current.ok_or(EngineError::NotFound {
            entity: "Request",
            id: entry.request_id,
        })?;
        let current: RequestStatus = current.parse().map_err(EngineError::InvalidData)?;
        return Err(EngineError::InvalidTransition {
            request_id: entry.request_id,
            current,
            attempted: "post",
        });
    }

    let inserted = sqlx::query(
        "INSERT INTO member_transactions \
         (user_id, request_id, prev_entry_id, amount, direction, balance_after, created_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?)"
    )
    .bind(entry.member_id)
    .bind(entry.request_id)
    .bind(entry.prior_entry_id.unwrap_or(0))
    .bind(entry.amount)
    .bind(entry.direction.as_str())
    .bind(entry.balance_after)
    .bind(entry.created_at)
    .execute(&mut *tx)
    .await;

    let entry_id = match inserted {
        Ok(result) => result.last_insert_id() as i64,
        Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
            // Lost a race the locks did not cover; the unique keys tell us which
            warn!(
                request_id = entry.request_id,
                "Ledger insert hit a unique key: {}", db_err
            );
            tx.rollback().await?;
            return match get_entry_by_request(pool, entry.request_id).await? {
                Some(existing) => Err(EngineError::DuplicatePosting {
                    request_id: entry.request_id,
                    entry_id: existing.id,
                }),
                None => Err(EngineError::StaleBalance {
                    member_id: entry.member_id,
                }),
            };
        }
        Err(e) => return Err(e.into()),
    };

    let sql = format!("SELECT {} FROM member_transactions WHERE id = ?", ENTRY_COLUMNS);
    let row = sqlx::query(&sql).bind(entry_id).fetch_one(&mut *tx).await?;
    let created = entry_from_row(&row)?;

    tx.commit().await?;

    Ok(created)
}
