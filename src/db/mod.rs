use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::mysql::MySqlPool;
use sqlx::Row;
use tracing::{error, info, warn};

use crate::models::{
    ChangeKind, MemberTransaction, NewLedgerEntry, NewRequest, Notification, RequestStatus, Table,
    TransactionProof, TransactionRequest,
};
use crate::utils::{EngineError, Result};

pub mod change_log;
pub mod request;
pub mod ledger;
pub mod proof;
pub mod notification;
pub mod user;
pub mod mysql;
pub mod memory;

pub use memory::MemoryStore;
pub use mysql::MySqlStore;

/// Filter for `transaction_requests` selects, newest first
#[derive(Debug, Clone, Default)]
pub struct RequestQuery {
    pub member_id: Option<i64>,
    pub status: Option<RequestStatus>,
    pub limit: Option<u32>,
}

impl RequestQuery {
    pub fn for_member(member_id: i64) -> Self {
        Self {
            member_id: Some(member_id),
            ..Self::default()
        }
    }

    pub fn with_status(status: RequestStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }
}

/// Compare-and-set status update for one request
#[derive(Debug, Clone)]
pub struct StatusChange {
    pub request_id: i64,
    pub from: RequestStatus,
    pub to: RequestStatus,
    pub actor_id: i64,
    pub at: DateTime<Utc>,
    pub reason: Option<String>,
}

/// What the engine needs from the relational store
///
/// Every committed write must reach the change feed: [`MemoryStore`] publishes
/// it directly, [`MySqlStore`] relies on the `change_log` triggers.
#[async_trait]
pub trait Store: Send + Sync {
    async fn insert_request(&self, new: &NewRequest) -> Result<TransactionRequest>;

    async fn get_request(&self, request_id: i64) -> Result<Option<TransactionRequest>>;

    async fn list_requests(&self, query: &RequestQuery) -> Result<Vec<TransactionRequest>>;

    /// Set the declared reference of a still-pending request
    async fn set_declared_reference(&self, request_id: i64, reference: &str) -> Result<bool>;

    /// Remove a pending request that never got its proof stored
    async fn delete_pending_request(&self, request_id: i64) -> Result<bool>;

    /// Apply `change` only if the request is still in `change.from`.
    /// Returns `None` when the status had already moved on.
    async fn transition_request(&self, change: &StatusChange) -> Result<Option<TransactionRequest>>;

    async fn insert_proof(&self, proof: &TransactionProof) -> Result<()>;

    async fn get_proof(&self, request_id: i64) -> Result<Option<TransactionProof>>;

    async fn latest_ledger_entry(&self, member_id: i64) -> Result<Option<MemberTransaction>>;

    async fn ledger_entry_for_request(&self, request_id: i64) -> Result<Option<MemberTransaction>>;

    /// A member's ledger in creation order
    async fn list_ledger(&self, member_id: i64) -> Result<Vec<MemberTransaction>>;

    /// Append a ledger entry and move its request from `verified` to `posted`,
    /// atomically.
    ///
    /// Fails with `DuplicatePosting` if the request already has an entry,
    /// `StaleBalance` if `entry.prior_entry_id` is no longer the member's latest
    /// entry, and `InvalidTransition` if the request is not `verified`.
    async fn append_ledger_entry(&self, entry: &NewLedgerEntry) -> Result<MemberTransaction>;

    async fn user_role(&self, user_id: i64) -> Result<Option<String>>;

    async fn list_notifications(&self, user_id: i64) -> Result<Vec<Notification>>;

    /// `false` if no such notification exists
    async fn mark_notification_read(&self, notification_id: i64) -> Result<bool>;

    async fn mark_all_notifications_read(&self, user_id: i64) -> Result<u64>;
}

/// Row payload for change events, keyed by column name
pub(crate) fn row_json<T: Serialize>(row: &T) -> serde_json::Value {
    serde_json::to_value(row).unwrap_or_else(|e| {
        warn!("Change row not serializable, filtered subscribers will miss it: {}", e);
        serde_json::Value::Null
    })
}

/// A unique key on `member_transactions` that posting relies on
struct LedgerGuard {
    name: &'static str,
    columns: &'static [&'static str],
}

const LEDGER_GUARDS: [LedgerGuard; 2] = [
    LedgerGuard {
        name: "UNIQUE(request_id)",
        columns: &["request_id"],
    },
    LedgerGuard {
        name: "UNIQUE(user_id, prev_entry_id)",
        columns: &["user_id", "prev_entry_id"],
    },
];

/// Which ledger guards have no matching unique index
///
/// `unique_indexes` maps index name to its columns in key order.
pub fn missing_ledger_guards(unique_indexes: &BTreeMap<String, Vec<String>>) -> Vec<&'static str> {
    LEDGER_GUARDS
        .iter()
        .filter(|guard| {
            !unique_indexes
                .values()
                .any(|indexed| indexed.iter().map(String::as_str).eq(guard.columns.iter().copied()))
        })
        .map(|guard| guard.name)
        .collect()
}

/// Change-log triggers that should exist but do not
pub fn missing_change_triggers(present: &BTreeSet<String>) -> Vec<String> {
    Table::ALL
        .iter()
        .flat_map(|table| {
            [ChangeKind::Insert, ChangeKind::Update, ChangeKind::Delete]
                .into_iter()
                .map(move |kind| format!("trg_{}_{}", table, kind.as_str()))
        })
        .filter(|name| !present.contains(name))
        .collect()
}

/// Initialize the MySQL connection pool and create tables
///
/// Refuses to hand out a pool when the ledger lacks its unique keys, for
/// example on a `member_transactions` table created by an older schema.
pub async fn init_db(database_url: &str) -> Result<MySqlPool> {
    let pool = MySqlPool::connect(database_url).await?;

    // Create all tables
    create_tables(&pool).await?;
    verify_schema(&pool).await?;

    Ok(pool)
}

async fn verify_schema(pool: &MySqlPool) -> Result<()> {
    let rows = sqlx::query(
        "SELECT CAST(INDEX_NAME AS CHAR) AS index_name, CAST(COLUMN_NAME AS CHAR) AS column_name \
         FROM information_schema.STATISTICS \
         WHERE TABLE_SCHEMA = DATABASE() AND TABLE_NAME = 'member_transactions' AND NON_UNIQUE = 0 \
         ORDER BY INDEX_NAME, SEQ_IN_INDEX"
    )
    .fetch_all(pool)
    .await?;

    let mut unique_indexes: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for row in &rows {
        let index: String = row.try_get("index_name")?;
        let column: String = row.try_get("column_name")?;
        unique_indexes.entry(index).or_default().push(column);
    }

    let missing = missing_ledger_guards(&unique_indexes);
    if !missing.is_empty() {
        error!(missing = ?missing, "member_transactions lacks its posting guards");
        return Err(EngineError::Schema(format!(
            "member_transactions is missing {}; migrate the table before starting",
            missing.join(" and ")
        )));
    }

    let present: BTreeSet<String> = sqlx::query_scalar(
        "SELECT CAST(TRIGGER_NAME AS CHAR) FROM information_schema.TRIGGERS \
         WHERE TRIGGER_SCHEMA = DATABASE()"
    )
    .fetch_all(pool)
    .await?
    .into_iter()
    .collect();

    let missing = missing_change_triggers(&present);
    if !missing.is_empty() {
        // Writes to those tables will not reach any console's change feed
        warn!(missing = ?missing, "Change log triggers missing");
    }

    Ok(())
}

/// Read and execute SQL file for creating tables
async fn execute_sql_file(pool: &MySqlPool, file_path: &str) -> std::result::Result<usize, String> {
    let sql_content = std::fs::read_to_string(file_path)
        .map_err(|e| format!("Failed to read {}: {}", file_path, e))?;

    let mut executed = 0;
    // Split by DELIMITER changes and execute statements
    for statement in sql_content.split("//").skip(1) {
        let trimmed = statement.trim();
        if !trimmed.is_empty() && trimmed != "DELIMITER ;" {
            match sqlx::raw_sql(trimmed).execute(pool).await {
                Ok(_) => executed += 1,
                Err(e) => warn!("Schema statement failed (continuing): {}", e),
            }
        }
    }

    Ok(executed)
}

/// Create all database tables
async fn create_tables(pool: &MySqlPool) -> std::result::Result<(), sqlx::Error> {
    match execute_sql_file(pool, "migrations/create_tables.sql").await {
        Ok(count) => info!("Applied {} schema statements", count),
        Err(e) => warn!("Failed to create tables: {}", e),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    /// Index name to comma separated columns
    fn indexes(pairs: &[(&str, &str)]) -> BTreeMap<String, Vec<String>> {
        pairs
            .iter()
            .map(|(name, columns)| {
                (name.to_string(), columns.split(',').map(str::to_string).collect())
            })
            .collect()
    }

    #[test]
    fn test_ledger_guards_found_by_columns() {
        let migrated = indexes(&[
            ("PRIMARY", "id"),
            ("uq_member_tx_request", "request_id"),
            ("uq_member_tx_chain", "user_id,prev_entry_id"),
        ]);
        assert!(missing_ledger_guards(&migrated).is_empty());

        let renamed = indexes(&[
            ("PRIMARY", "id"),
            ("request_id", "request_id"),
            ("chain", "user_id,prev_entry_id"),
        ]);
        assert!(missing_ledger_guards(&renamed).is_empty());
    }

    #[test]
    fn test_legacy_ledger_table_is_refused() {
        let legacy = indexes(&[("PRIMARY", "id")]);
        assert_eq!(
            missing_ledger_guards(&legacy),
            vec!["UNIQUE(request_id)", "UNIQUE(user_id, prev_entry_id)"]
        );

        // Column order matters for the chain key
        let reversed = indexes(&[
            ("PRIMARY", "id"),
            ("uq_member_tx_request", "request_id"),
            ("uq_member_tx_chain", "prev_entry_id,user_id"),
        ]);
        assert_eq!(missing_ledger_guards(&reversed), vec!["UNIQUE(user_id, prev_entry_id)"]);
    }

    #[test]
    fn test_missing_change_triggers_are_named() {
        let mut present: BTreeSet<String> = missing_change_triggers(&BTreeSet::new())
            .into_iter()
            .collect();
        assert_eq!(present.len(), Table::ALL.len() * 3);
        assert!(present.contains("trg_transaction_requests_insert"));

        present.remove("trg_notifications_update");
        assert_eq!(missing_change_triggers(&present), vec!["trg_notifications_update".to_string()]);
    }

    #[test]
    fn test_unserializable_row_becomes_null() {
        let mut row = HashMap::new();
        row.insert((1, 2), "tuple keys are not valid JSON object keys");
        assert_eq!(row_json(&row), serde_json::Value::Null);
        assert_eq!(row_json(&serde_json::json!({ "user_id": 4 }))["user_id"], 4);
    }
}
