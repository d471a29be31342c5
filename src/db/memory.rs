//! In-memory [`Store`] with the same uniqueness and compare-and-set rules as
//! the SQL schema. Backs the test suite and local runs without a database.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;

use super::{row_json, RequestQuery, StatusChange, Store};
use crate::feed::FeedPublisher;
use crate::models::{
    ChangeEvent, ChangeKind, MemberTransaction, NewLedgerEntry, NewRequest, Notification,
    RequestStatus, Table, TransactionProof, TransactionRequest,
};
use crate::utils::{EngineError, Result};

struct StoredEntry {
    entry: MemberTransaction,
    prev_entry_id: i64,
}

#[derive(Default)]
struct MemoryState {
    next_request_id: i64,
    next_entry_id: i64,
    next_notification_id: i64,
    requests: BTreeMap<i64, TransactionRequest>,
    proofs: HashMap<i64, TransactionProof>,
    entries: Vec<StoredEntry>,
    users: HashMap<i64, String>,
    notifications: BTreeMap<i64, Notification>,
}

impl MemoryState {
    fn latest_entry(&self, member_id: i64) -> Option<&MemberTransaction> {
        self.entries
            .iter()
            .map(|stored| &stored.entry)
            .filter(|entry| entry.member_id == member_id)
            .max_by_key(|entry| (entry.created_at, entry.id))
    }

    fn entry_for_request(&self, request_id: i64) -> Option<&MemberTransaction> {
        self.entries
            .iter()
            .map(|stored| &stored.entry)
            .find(|entry| entry.request_id == request_id)
    }
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    publisher: Option<FeedPublisher>,
    lose_next_append_ack: AtomicBool,
    fail_next_reference_update: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_publisher(publisher: FeedPublisher) -> Self {
        Self {
            publisher: Some(publisher),
            ..Self::default()
        }
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, events: Vec<ChangeEvent>) {
        if let Some(publisher) = &self.publisher {
            for event in events {
                publisher.publish(event);
            }
        }
    }

    pub fn add_user(&self, user_id: i64, role: &str) {
        self.lock().users.insert(user_id, role.to_string());
    }

    pub fn add_notification(&self, user_id: i64, title: &str, body: &str) -> Notification {
        let notification = {
            let mut state = self.lock();
            state.next_notification_id += 1;
            let notification = Notification {
                id: state.next_notification_id,
                user_id,
                title: title.to_string(),
                body: body.to_string(),
                is_read: false,
                created_at: Utc::now(),
            };
            state.notifications.insert(notification.id, notification.clone());
            notification
        };
        self.publish(vec![ChangeEvent::new(
            Table::Notifications,
            ChangeKind::Insert,
            row_json(&notification),
        )]);
        notification
    }

    /// Make the next ledger append commit but report a failure, as if the
    /// connection dropped before the acknowledgement arrived
    pub fn lose_next_append_ack(&self) {
        self.lose_next_append_ack.store(true, Ordering::SeqCst);
    }

    /// Make the next `set_declared_reference` fail without writing anything
    pub fn fail_next_reference_update(&self) {
        self.fail_next_reference_update.store(true, Ordering::SeqCst);
    }

    /// Id handed to the next inserted request
    pub fn set_next_request_id(&self, id: i64) {
        self.lock().next_request_id = id - 1;
    }

    pub fn entry_count(&self) -> usize {
        self.lock().entries.len()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert_request(&self, new: &NewRequest) -> Result<TransactionRequest> {
        let created = {
            let mut state = self.lock();
            state.next_request_id += 1;
            let created = TransactionRequest {
                id: state.next_request_id,
                member_id: new.member_id,
                amount: new.amount,
                kind: new.kind,
                external_reference: new.external_reference.clone(),
                status: RequestStatus::Pending,
                created_at: Utc::now(),
                acted_by: None,
                acted_at: None,
                rejection_reason: None,
            };
            state.requests.insert(created.id, created.clone());
            created
        };

        self.publish(vec![ChangeEvent::new(
            Table::TransactionRequests,
            ChangeKind::Insert,
            row_json(&created),
        )]);
        Ok(created)
    }

    async fn get_request(&self, request_id: i64) -> Result<Option<TransactionRequest>> {
        Ok(self.lock().requests.get(&request_id).cloned())
    }

    async fn list_requests(&self, query: &RequestQuery) -> Result<Vec<TransactionRequest>> {
        let state = self.lock();
        let mut matched: Vec<TransactionRequest> = state
            .requests
            .values()
            .filter(|r| query.member_id.map_or(true, |m| r.member_id == m))
            .filter(|r| query.status.map_or(true, |s| r.status == s))
            .cloned()
            .collect();

        matched.sort_by(|a, b| (b.created_at, b.id).cmp(&(a.created_at, a.id)));
        if let Some(limit) = query.limit {
            matched.truncate(limit as usize);
        }
        Ok(matched)
    }

    async fn set_declared_reference(&self, request_id: i64, reference: &str) -> Result<bool> {
        if self.fail_next_reference_update.swap(false, Ordering::SeqCst) {
            return Err(EngineError::Database(sqlx::Error::PoolTimedOut));
        }
        let updated = {
            let mut state = self.lock();
            match state.requests.get_mut(&request_id) {
                Some(request) if request.status == RequestStatus::Pending => {
                    request.external_reference = Some(reference.to_string());
                    request.clone()
                }
                _ => return Ok(false),
            }
        };

        self.publish(vec![ChangeEvent::new(
            Table::TransactionRequests,
            ChangeKind::Update,
            row_json(&updated),
        )]);
        Ok(true)
    }

    async fn delete_pending_request(&self, request_id: i64) -> Result<bool> {
        let deleted = {
            let mut state = self.lock();
            let deletable = state
                .requests
                .get(&request_id)
                .map_or(false, |r| r.status == RequestStatus::Pending)
                && !state.proofs.contains_key(&request_id);
            if !deletable {
                return Ok(false);
            }
            state.requests.remove(&request_id)
        };

        if let Some(deleted) = deleted {
            self.publish(vec![ChangeEvent::new(
                Table::TransactionRequests,
                ChangeKind::Delete,
                row_json(&deleted),
            )]);
        }
        Ok(true)
    }

    async fn transition_request(
        &self,
        change: &StatusChange,
    ) -> Result<Option<TransactionRequest>> {
        let updated = {
            let mut state = self.lock();
            let Some(request) = state.requests.get_mut(&change.request_id) else {
                return Err(EngineError::NotFound {
                    entity: "Request",
                    id: change.request_id,
                });
            };
            if request.status != change.from {
                return Ok(None);
            }
            request.status = change.to;
            request.acted_by = Some(change.actor_id);
            request.acted_at = Some(change.at);
            request.rejection_reason = change.reason.clone();
            request.clone()
        };

        self.publish(vec![ChangeEvent::new(
            Table::TransactionRequests,
            ChangeKind::Update,
            row_json(&updated),
        )]);
        Ok(Some(updated))
    }

    async fn insert_proof(&self, proof: &TransactionProof) -> Result<()> {
        {
            let mut state = self.lock();
            if state.proofs.contains_key(&proof.request_id) {
                return Err(EngineError::InvalidData(format!(
                    "request {} already has a proof",
                    proof.request_id
                )));
            }
            if state.proofs.values().any(|p| p.storage_path == proof.storage_path) {
                return Err(EngineError::InvalidData(format!(
                    "proof path {} already recorded",
                    proof.storage_path
                )));
            }
            state.proofs.insert(proof.request_id, proof.clone());
        }

        self.publish(vec![ChangeEvent::new(
            Table::TransactionProofs,
            ChangeKind::Insert,
            row_json(proof),
        )]);
        Ok(())
    }

    async fn get_proof(&self, request_id: i64) -> Result<Option<TransactionProof>> {
        Ok(self.lock().proofs.get(&request_id).cloned())
    }

    async fn latest_ledger_entry(&self, member_id: i64) -> Result<Option<MemberTransaction>> {
        Ok(self.lock().latest_entry(member_id).cloned())
    }

    async fn ledger_entry_for_request(&self, request_id: i64) -> Result<Option<MemberTransaction>> {
        Ok(self.lock().entry_for_request(request_id).cloned())
    }

    async fn list_ledger(&self, member_id: i64) -> Result<Vec<MemberTransaction>> {
        let state = self.lock();
        let mut entries: Vec<MemberTransaction> = state
            .entries
            .iter()
            .map(|stored| stored.entry.clone())
            .filter(|entry| entry.member_id == member_id)
            .collect();
        entries.sort_by_key(|entry| (entry.created_at, entry.id));
        Ok(entries)
    }

    async fn append_ledger_entry(&self, entry: &NewLedgerEntry) -> Result<MemberTransaction> {
        let (created, posted_request) = {
            let mut state = self.lock();

            if let Some(existing) = state.entry_for_request(entry.request_id) {
                return Err(EngineError::DuplicatePosting {
                    request_id: entry.request_id,
                    entry_id: existing.id,
                });
            }

            let latest_id = state.latest_entry(entry.member_id).map(|e| e.id);
            let prev_entry_id = entry.prior_entry_id.unwrap_or(0);
            let chain_taken = state
                .entries
                .iter()
                .any(|s| s.entry.member_id == entry.member_id && s.prev_entry_id == prev_entry_id);
            if latest_id != entry.prior_entry_id || chain_taken {
                return Err(EngineError::StaleBalance {
                    member_id: entry.member_id,
                });
            }

            let Some(request) = state.requests.get_mut(&entry.request_id) else {
                return Err(EngineError::NotFound {
                    entity: "Request",
                    id: entry.request_id,
                });
            };
            if request.status != RequestStatus::Verified {
                return Err(EngineError::InvalidTransition {
                    request_id: entry.request_id,
                    current: request.status,
                    attempted: "post",
                });
            }
            request.status = RequestStatus::Posted;
            let posted_request = request.clone();

            state.next_entry_id += 1;
            let created = MemberTransaction {
                id: state.next_entry_id,
                member_id: entry.member_id,
                request_id: entry.request_id,
                amount: entry.amount,
                direction: entry.direction,
                balance_after: entry.balance_after,
                created_at: entry.created_at,
            };
            state.entries.push(StoredEntry {
                entry: created.clone(),
                prev_entry_id,
            });
            (created, posted_request)
        };

        self.publish(vec![
            ChangeEvent::new(Table::MemberTransactions, ChangeKind::Insert, row_json(&created)),
            ChangeEvent::new(
                Table::TransactionRequests,
                ChangeKind::Update,
                row_json(&posted_request),
            ),
        ]);

        if self.lose_next_append_ack.swap(false, Ordering::SeqCst) {
            return Err(EngineError::Database(sqlx::Error::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "connection reset after commit",
            ))));
        }
        Ok(created)
    }

    async fn user_role(&self, user_id: i64) -> Result<Option<String>> {
        Ok(self.lock().users.get(&user_id).cloned())
    }

    async fn list_notifications(&self, user_id: i64) -> Result<Vec<Notification>> {
        let state = self.lock();
        let mut matched: Vec<Notification> = state
            .notifications
            .values()
            .filter(|n| n.user_id == user_id)
            .cloned()
            .collect();
        matched.sort_by(|a, b| (b.created_at, b.id).cmp(&(a.created_at, a.id)));
        Ok(matched)
    }

    async fn mark_notification_read(&self, notification_id: i64) -> Result<bool> {
        let user_id = {
            let mut state = self.lock();
            match state.notifications.get_mut(&notification_id) {
                Some(notification) => {
                    notification.is_read = true;
                    notification.user_id
                }
                None => return Ok(false),
            }
        };

        self.publish(vec![ChangeEvent::new(
            Table::Notifications,
            ChangeKind::Update,
            json!({ "id": notification_id, "user_id": user_id, "is_read": true }),
        )]);
        Ok(true)
    }

    async fn mark_all_notifications_read(&self, user_id: i64) -> Result<u64> {
        let changed = {
            let mut state = self.lock();
            let mut changed = 0;
            for notification in state.notifications.values_mut() {
                if notification.user_id == user_id && !notification.is_read {
                    notification.is_read = true;
                    changed += 1;
                }
            }
            changed
        };

        if changed > 0 {
            self.publish(vec![ChangeEvent::new(
                Table::Notifications,
                ChangeKind::Update,
                json!({ "user_id": user_id, "is_read": true }),
            )]);
        }
        Ok(changed)
    }
}
