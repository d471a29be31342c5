//! Change source that follows the shared `change_log` table
//!
//! Table triggers append one row per committed change, whoever made it, so
//! every console sees member devices and other consoles alike. Ids come from
//! `AUTO_INCREMENT`, which hands them out before commit: a lower id can become
//! visible after a higher one. Skipped ids are kept as gaps and re-checked
//! until they show up or time out (a rolled back write never shows up).

use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use sqlx::mysql::MySqlPool;
use tokio::time::{Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::source::{ChangeSource, ChangeStream};
use crate::db::change_log::{self, ChangeLogRow};
use crate::models::{ChangeEvent, ChangeKind, Table};
use crate::utils::{EngineError, Result};

/// Rows read per poll
const BATCH_SIZE: u32 = 500;

/// How long a skipped id is waited for
const GAP_TIMEOUT: Duration = Duration::from_secs(30);

/// Skipped ids tracked at once. Beyond this the stream resyncs instead.
const MAX_TRACKED_GAPS: usize = 1_000;

/// Minimum time between two prunes of old changes
const PRUNE_EVERY: Duration = Duration::from_secs(60);

/// Read position in the change log
#[derive(Debug, Clone)]
pub struct ChangeCursor {
    last_id: i64,
    gaps: BTreeMap<i64, Instant>,
}

impl ChangeCursor {
    pub fn new(last_id: i64) -> Self {
        Self {
            last_id,
            gaps: BTreeMap::new(),
        }
    }

    pub fn last_id(&self) -> i64 {
        self.last_id
    }

    pub fn gaps(&self) -> Vec<i64> {
        self.gaps.keys().copied().collect()
    }

    /// Record that change `id` was read. Returns whether it is new.
    ///
    /// Fails when the ids skipped over would exceed what can be tracked.
    pub fn accept(&mut self, id: i64, now: Instant) -> Result<bool> {
        if id <= self.last_id {
            return Ok(self.gaps.remove(&id).is_some());
        }

        let skipped = (id - self.last_id - 1) as usize;
        if self.gaps.len() + skipped > MAX_TRACKED_GAPS {
            return Err(EngineError::TransportUnavailable(format!(
                "change log skipped {} ids after {}",
                skipped, self.last_id
            )));
        }
        for missing in self.last_id + 1..id {
            self.gaps.insert(missing, now);
        }
        self.last_id = id;
        Ok(true)
    }

    /// Forget gaps older than `timeout`, returning how many were dropped
    pub fn expire(&mut self, now: Instant, timeout: Duration) -> usize {
        let before = self.gaps.len();
        self.gaps
            .retain(|_, first_seen| now.duration_since(*first_seen) < timeout);
        before - self.gaps.len()
    }
}

/// Turn a logged row into an event
///
/// `Ok(None)` for tables that are not on the feed. A row whose kind or payload
/// cannot be read is an error, since filtered subscribers could miss it.
pub fn decode_change(row: &ChangeLogRow) -> Result<Option<ChangeEvent>> {
    let Ok(table) = row.table_name.parse::<Table>() else {
        debug!(id = row.id, table = %row.table_name, "Ignoring change on unwatched table");
        return Ok(None);
    };
    let kind: ChangeKind = row.change_kind.parse().map_err(|e: String| {
        EngineError::InvalidData(format!("change {}: {}", row.id, e))
    })?;
    let data = serde_json::from_str(&row.row_data).map_err(|e| {
        EngineError::InvalidData(format!("change {} has unreadable row data: {}", row.id, e))
    })?;

    Ok(Some(ChangeEvent::new(table, kind, data)))
}

/// [`ChangeSource`] over the `change_log` table
pub struct PollingSource {
    pool: MySqlPool,
    interval: Duration,
    retention: Option<Duration>,
}

impl PollingSource {
    pub fn new(pool: MySqlPool, interval: Duration) -> Self {
        Self {
            pool,
            interval,
            retention: None,
        }
    }

    /// Delete changes older than `retention` while polling
    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = Some(retention);
        self
    }
}

fn transport_error(e: sqlx::Error) -> EngineError {
    EngineError::TransportUnavailable(format!("change log unavailable: {}", e))
}

#[async_trait]
impl ChangeSource for PollingSource {
    async fn connect(&self) -> Result<Box<dyn ChangeStream>> {
        // Anything older is covered by the resync the bus sends on reconnect
        let last_id = change_log::get_latest_change_id(&self.pool)
            .await
            .map_err(transport_error)?;
        info!(last_id, interval_ms = self.interval.as_millis() as u64, "Following change log");

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        Ok(Box::new(PollingStream {
            pool: self.pool.clone(),
            cursor: ChangeCursor::new(last_id),
            ticker,
            buffer: VecDeque::new(),
            retention: self.retention,
            last_prune: None,
        }))
    }
}

struct PollingStream {
    pool: MySqlPool,
    cursor: ChangeCursor,
    ticker: Interval,
    buffer: VecDeque<ChangeEvent>,
    retention: Option<Duration>,
    last_prune: Option<Instant>,
}

impl PollingStream {
    async fn poll(&mut self) -> Result<()> {
        let now = Instant::now();

        let late = change_log::get_changes_by_ids(&self.pool, &self.cursor.gaps())
            .await
            .map_err(transport_error)?;
        let fresh = change_log::get_changes_after(&self.pool, self.cursor.last_id(), BATCH_SIZE)
            .await
            .map_err(transport_error)?;

        for row in late.iter().chain(fresh.iter()) {
            if !self.cursor.accept(row.id, now)? {
                continue;
            }
            if let Some(event) = decode_change(row)? {
                self.buffer.push_back(event);
            }
        }

        let expired = self.cursor.expire(now, GAP_TIMEOUT);
        if expired > 0 {
            debug!(expired, "Change log ids never committed");
        }

        self.prune(now).await;
        Ok(())
    }

    async fn prune(&mut self, now: Instant) {
        let Some(retention) = self.retention else {
            return;
        };
        if self
            .last_prune
            .is_some_and(|at| now.duration_since(at) < PRUNE_EVERY)
        {
            return;
        }
        self.last_prune = Some(now);

        match change_log::prune_changes(&self.pool, retention).await {
            Ok(0) => {}
            Ok(removed) => debug!(removed, "Pruned old changes"),
            Err(e) => warn!("Failed to prune change log: {}", e),
        }
    }
}

#[async_trait]
impl ChangeStream for PollingStream {
    async fn next_event(&mut self) -> Option<Result<ChangeEvent>> {
        loop {
            if let Some(event) = self.buffer.pop_front() {
                return Some(Ok(event));
            }
            self.ticker.tick().await;
            if let Err(e) = self.poll().await {
                return Some(Err(e));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn logged(id: i64, table: &str, kind: &str, data: &str) -> ChangeLogRow {
        ChangeLogRow {
            id,
            table_name: table.to_string(),
            change_kind: kind.to_string(),
            row_data: data.to_string(),
        }
    }

    #[test]
    fn test_decode_trigger_row() {
        let row = logged(
            9,
            "transaction_requests",
            "insert",
            r#"{"id": 777, "user_id": 42, "kind": "withdraw", "status": "pending"}"#,
        );

        let event = decode_change(&row).expect("decode").expect("event");
        assert_eq!(event.table, Table::TransactionRequests);
        assert_eq!(event.kind, ChangeKind::Insert);
        assert_eq!(
            event.row,
            json!({ "id": 777, "user_id": 42, "kind": "withdraw", "status": "pending" })
        );
    }

    #[test]
    fn test_decode_skips_unwatched_tables_and_rejects_garbage() {
        assert_eq!(decode_change(&logged(1, "audit_trail", "insert", "{}")).expect("decode"), None);
        assert!(decode_change(&logged(2, "notifications", "upsert", "{}")).is_err());
        assert!(decode_change(&logged(3, "notifications", "update", "{not json")).is_err());
    }

    #[test]
    fn test_cursor_delivers_late_commits_once() {
        let start = Instant::now();
        let mut cursor = ChangeCursor::new(10);

        // 11 and 12 are still uncommitted when 13 shows up
        assert!(cursor.accept(13, start).expect("accept"));
        assert_eq!(cursor.last_id(), 13);
        assert_eq!(cursor.gaps(), vec![11, 12]);

        assert!(cursor.accept(12, start).expect("accept"));
        assert!(!cursor.accept(12, start).expect("accept"));
        assert!(!cursor.accept(13, start).expect("accept"));
        assert_eq!(cursor.gaps(), vec![11]);

        // 11 was rolled back and never appears
        assert_eq!(cursor.expire(start + GAP_TIMEOUT / 2, GAP_TIMEOUT), 0);
        assert_eq!(cursor.expire(start + GAP_TIMEOUT, GAP_TIMEOUT), 1);
        assert!(cursor.gaps().is_empty());
        assert!(!cursor.accept(11, start + GAP_TIMEOUT).expect("accept"));
    }

    #[test]
    fn test_cursor_refuses_gaps_it_cannot_track() {
        let mut cursor = ChangeCursor::new(0);
        let err = cursor
            .accept(MAX_TRACKED_GAPS as i64 + 2, Instant::now())
            .unwrap_err();
        assert!(matches!(err, EngineError::TransportUnavailable(_)));
        assert_eq!(cursor.last_id(), 0);

        assert!(cursor.accept(1, Instant::now()).expect("accept"));
        assert!(cursor.gaps().is_empty());
    }

    #[test]
    fn test_trigger_payload_keeps_filter_columns_matching() {
        let data = r#"{"id": 3, "user_id": 5, "is_read": true}"#;
        let row = logged(5, "notifications", "update", data);
        let event = decode_change(&row).expect("decode").expect("event");
        assert!(crate::feed::RowFilter::eq("user_id", 5).matches(&event.row));
        assert!(crate::feed::RowFilter::eq("is_read", true).matches(&event.row));
    }

    #[test]
    fn test_schema_logs_changes_for_every_feed_table() {
        let schema = include_str!("../../migrations/create_tables.sql");
        assert!(schema.contains("CREATE TABLE IF NOT EXISTS change_log"));
        for table in Table::ALL {
            for kind in [ChangeKind::Insert, ChangeKind::Update, ChangeKind::Delete] {
                let trigger = format!(
                    "CREATE TRIGGER IF NOT EXISTS trg_{}_{} AFTER {} ON {}",
                    table,
                    kind.as_str(),
                    kind.as_str().to_uppercase(),
                    table
                );
                assert!(schema.contains(&trigger), "missing `{}`", trigger);
            }
        }
    }
}
