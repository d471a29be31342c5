//! Request lifecycle: submission, disposition and posting
//!
//! `pending -> verified -> posted` or `pending -> rejected`. Posting is the
//! only path that writes `member_transactions`, and it is idempotent per
//! request: a retry after a lost acknowledgement returns the entry that was
//! already committed.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::db::{RequestQuery, StatusChange, Store};
use crate::models::{
    CapturedImage, Direction, MemberTransaction, NewLedgerEntry, NewRequest, RequestStatus,
    TransactionKind, TransactionProof, TransactionRequest,
};
use crate::services::proof_service::ProofService;
use crate::utils::{EngineError, Result};

/// Attempts at the compare-and-set append before giving up
const MAX_POST_ATTEMPTS: usize = 8;

/// Which transaction kinds credit the member's balance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SignPolicy {
    pub repayment_credits: bool,
    pub share_purchase_credits: bool,
}

impl SignPolicy {
    pub fn direction(&self, kind: TransactionKind) -> Direction {
        let credits = match kind {
            TransactionKind::Deposit => true,
            TransactionKind::Withdraw => false,
            TransactionKind::Repayment => self.repayment_credits,
            TransactionKind::SharePurchase => self.share_purchase_credits,
        };
        if credits {
            Direction::Credit
        } else {
            Direction::Debit
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct LifecyclePolicy {
    pub proof_required: bool,
    pub auto_post_on_verify: bool,
    pub sign_policy: SignPolicy,
}

impl Default for LifecyclePolicy {
    fn default() -> Self {
        Self {
            proof_required: true,
            auto_post_on_verify: false,
            sign_policy: SignPolicy::default(),
        }
    }
}

impl From<&Config> for LifecyclePolicy {
    fn from(config: &Config) -> Self {
        Self {
            proof_required: config.proof_required,
            auto_post_on_verify: config.auto_post_on_verify,
            sign_policy: config.sign_policy,
        }
    }
}

/// Result of a submission
#[derive(Debug, Clone)]
pub struct Submission {
    pub request: TransactionRequest,
    pub proof: Option<TransactionProof>,
    pub manual_entry_required: bool,
}

pub struct RequestService {
    store: Arc<dyn Store>,
    proofs: Option<ProofService>,
    policy: LifecyclePolicy,
    member_locks: Mutex<HashMap<i64, Arc<tokio::sync::Mutex<()>>>>,
}

impl RequestService {
    pub fn new(
        store: Arc<dyn Store>,
        proofs: Option<ProofService>,
        policy: LifecyclePolicy,
    ) -> Self {
        Self {
            store,
            proofs,
            policy,
            member_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Serializes ledger writes for one member inside this process
    fn member_lock(&self, member_id: i64) -> Arc<tokio::sync::Mutex<()>> {
        self.member_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(member_id)
            .or_default()
            .clone()
    }

    /// Drop a member's lock once nobody else holds or waits on it
    fn release_member_lock(&self, member_id: i64, lock: Arc<tokio::sync::Mutex<()>>) {
        let mut locks = self.member_locks.lock().unwrap_or_else(PoisonError::into_inner);
        drop(lock);
        if locks.get(&member_id).is_some_and(|held| Arc::strong_count(held) == 1) {
            locks.remove(&member_id);
        }
    }

    async fn load(&self, request_id: i64) -> Result<TransactionRequest> {
        self.store
            .get_request(request_id)
            .await?
            .ok_or(EngineError::NotFound { entity: "Request", id: request_id })
    }

    /// Create a request and attach its proof image.
    ///
    /// When proofs are required the request only counts as submitted once
    /// its proof is stored; otherwise the pending row is deleted again.
    pub async fn submit(
        &self,
        new: NewRequest,
        image: Option<&CapturedImage>,
    ) -> Result<Submission> {
        if new.amount <= 0 {
            return Err(EngineError::InvalidData(format!(
                "amount must be positive, got {}",
                new.amount
            )));
        }
        if self.policy.proof_required && image.is_none() {
            return Err(EngineError::InvalidData("a proof image is required".to_string()));
        }

        let mut request = self.store.insert_request(&new).await?;
        info!(
            request_id = request.id,
            member_id = request.member_id,
            kind = %request.kind,
            "Request submitted"
        );

        let (Some(image), Some(proofs)) = (image, self.proofs.as_ref()) else {
            if self.policy.proof_required {
                self.compensate_submission(request.id).await;
                return Err(EngineError::Storage("proof capture is not configured".to_string()));
            }
            return Ok(Submission {
                request,
                proof: None,
                manual_entry_required: new.external_reference.is_none(),
            });
        };

        let stored = match proofs.capture(image, request.member_id, request.id).await {
            Ok(outcome) => self.store.insert_proof(&outcome.proof).await.map(|()| outcome),
            Err(e) => Err(e),
        };

        let outcome = match stored {
            Ok(outcome) => outcome,
            Err(e) if self.policy.proof_required => {
                self.compensate_submission(request.id).await;
                return Err(e);
            }
            Err(e) => {
                warn!(request_id = request.id, "Keeping request without proof: {}", e);
                return Ok(Submission {
                    request,
                    proof: None,
                    manual_entry_required: new.external_reference.is_none(),
                });
            }
        };

        // Request and proof are stored at this point; the pre-fill is best effort
        if request.external_reference.is_none() {
            if let Some(found) = &outcome.proof.reference {
                match self.store.set_declared_reference(request.id, &found.value).await {
                    Ok(true) => request.external_reference = Some(found.value.clone()),
                    Ok(false) => {
                        debug!(request_id = request.id, "Request left pending before pre-fill")
                    }
                    Err(e) => warn!(
                        request_id = request.id,
                        "Could not pre-fill extracted reference, manual entry needed: {}",
                        e
                    ),
                }
            }
        }

        Ok(Submission {
            manual_entry_required: request.external_reference.is_none(),
            request,
            proof: Some(outcome.proof),
        })
    }

    /// Compensating delete for a request whose proof never made it to storage
    async fn compensate_submission(&self, request_id: i64) {
        match self.store.delete_pending_request(request_id).await {
            Ok(true) => warn!(request_id, "Submission rolled back, proof was not stored"),
            Ok(false) => error!(request_id, "Submission rollback found nothing to delete"),
            Err(e) => error!(request_id, "Submission rollback failed: {}", e),
        }
    }

    /// Record the reference a member typed in for their pending request
    pub async fn declare_reference(
        &self,
        request_id: i64,
        member_id: i64,
        reference: &str,
    ) -> Result<TransactionRequest> {
        let reference = reference.trim().to_uppercase();
        if reference.is_empty() {
            return Err(EngineError::InvalidData("reference is empty".to_string()));
        }

        let request = self.load(request_id).await?;
        if request.member_id != member_id {
            return Err(EngineError::Forbidden {
                actor_id: member_id,
                action: "declare a reference on another member's request",
            });
        }
        if request.status != RequestStatus::Pending
            || !self.store.set_declared_reference(request_id, &reference).await?
        {
            let current = self.load(request_id).await?.status;
            return Err(EngineError::InvalidTransition {
                request_id,
                current,
                attempted: "declare a reference",
            });
        }

        self.load(request_id).await
    }

    async fn ensure_admin(&self, actor_id: i64, action: &'static str) -> Result<()> {
        match self.store.user_role(actor_id).await?.as_deref() {
            Some("admin") => Ok(()),
            _ => {
                warn!(actor_id, action, "Non-admin disposition attempt");
                Err(EngineError::Forbidden { actor_id, action })
            }
        }
    }

    /// Move a pending request to `to`, failing loudly if it already left `pending`
    async fn dispose(
        &self,
        request_id: i64,
        actor_id: i64,
        to: RequestStatus,
        reason: Option<String>,
        attempted: &'static str,
    ) -> Result<TransactionRequest> {
        let request = self.load(request_id).await?;
        if !request.status.can_transition_to(to) {
            warn!(
                request_id,
                current = %request.status,
                attempted,
                "Disposition on settled request"
            );
            return Err(EngineError::InvalidTransition {
                request_id,
                current: request.status,
                attempted,
            });
        }

        let change = StatusChange {
            request_id,
            from: RequestStatus::Pending,
            to,
            actor_id,
            at: Utc::now(),
            reason,
        };
        match self.store.transition_request(&change).await? {
            Some(updated) => {
                info!(request_id, actor_id, status = %updated.status, "Request disposed");
                Ok(updated)
            }
            None => {
                let current = self.load(request_id).await?.status;
                warn!(request_id, current = %current, attempted, "Lost disposition race");
                Err(EngineError::InvalidTransition { request_id, current, attempted })
            }
        }
    }

    pub async fn verify(&self, request_id: i64, actor_id: i64) -> Result<TransactionRequest> {
        self.ensure_admin(actor_id, "verify requests").await?;
        let verified = self
            .dispose(request_id, actor_id, RequestStatus::Verified, None, "verify")
            .await?;

        if !self.policy.auto_post_on_verify {
            return Ok(verified);
        }
        let entry = self.post(request_id).await?;
        debug!(request_id, entry_id = entry.id, "Posted on verify");
        self.load(request_id).await
    }

    pub async fn reject(
        &self,
        request_id: i64,
        actor_id: i64,
        reason: &str,
    ) -> Result<TransactionRequest> {
        self.ensure_admin(actor_id, "reject requests").await?;
        let reason = reason.trim();
        let reason = (!reason.is_empty()).then(|| reason.to_string());
        self.dispose(request_id, actor_id, RequestStatus::Rejected, reason, "reject")
            .await
    }

    /// Create the ledger entry for a verified request, exactly once
    pub async fn post(&self, request_id: i64) -> Result<MemberTransaction> {
        let member_id = self.load(request_id).await?.member_id;

        let lock = self.member_lock(member_id);
        let posted = {
            let _guard = lock.lock().await;
            self.post_serialized(request_id).await
        };
        self.release_member_lock(member_id, lock);
        posted
    }

    /// Body of [`RequestService::post`], run under the member's lock
    async fn post_serialized(&self, request_id: i64) -> Result<MemberTransaction> {
        if let Some(existing) = self.store.ledger_entry_for_request(request_id).await? {
            return self.settle_existing(request_id, existing).await;
        }
        let request = self.load(request_id).await?;
        if request.status != RequestStatus::Verified {
            warn!(request_id, current = %request.status, "Post attempted on unverified request");
            return Err(EngineError::InvalidTransition {
                request_id,
                current: request.status,
                attempted: "post",
            });
        }

        let direction = self.policy.sign_policy.direction(request.kind);
        for attempt in 1..=MAX_POST_ATTEMPTS {
            let latest = self.store.latest_ledger_entry(request.member_id).await?;
            let prior_balance = latest.as_ref().map_or(0, |entry| entry.balance_after);
            let now = Utc::now();
            let created_at = latest.as_ref().map_or(now, |entry| entry.created_at.max(now));

            let signed = direction.sign(request.amount);
            let Some(balance_after) = prior_balance.checked_add(signed) else {
                error!(
                    request_id,
                    member_id = request.member_id,
                    prior_balance,
                    amount = request.amount,
                    "Posting would overflow the balance"
                );
                return Err(EngineError::InvalidData(format!(
                    "posting {} to member {} would overflow a balance of {}",
                    request.amount, request.member_id, prior_balance
                )));
            };

            let entry = NewLedgerEntry {
                member_id: request.member_id,
                request_id,
                amount: request.amount,
                direction,
                balance_after,
                created_at,
                prior_entry_id: latest.as_ref().map(|entry| entry.id),
            };

            match self.store.append_ledger_entry(&entry).await {
                Ok(created) => {
                    info!(
                        request_id,
                        member_id = request.member_id,
                        entry_id = created.id,
                        balance_after = created.balance_after,
                        "Request posted"
                    );
                    return Ok(created);
                }
                Err(EngineError::DuplicatePosting { entry_id, .. }) => {
                    warn!(
                        request_id,
                        entry_id,
                        "Duplicate posting detected, returning existing entry"
                    );
                    let existing = self
                        .store
                        .ledger_entry_for_request(request_id)
                        .await?
                        .ok_or(EngineError::NotFound {
                            entity: "Ledger entry",
                            id: entry_id,
                        })?;
                    return self.settle_existing(request_id, existing).await;
                }
                Err(EngineError::StaleBalance { member_id }) => {
                    debug!(request_id, member_id, attempt, "Ledger moved during posting, retrying");
                }
                Err(EngineError::InvalidTransition { current, .. }) => {
                    // Another writer may have posted it between our reads
                    if let Some(existing) = self.store.ledger_entry_for_request(request_id).await? {
                        return self.settle_existing(request_id, existing).await;
                    }
                    warn!(request_id, current = %current, "Request left verified during posting");
                    return Err(EngineError::InvalidTransition {
                        request_id,
                        current,
                        attempted: "post",
                    });
                }
                Err(e) => return Err(e),
            }
        }

        error!(
            request_id,
            member_id = request.member_id,
            "Gave up posting after {} attempts",
            MAX_POST_ATTEMPTS
        );
        Err(EngineError::StaleBalance { member_id: request.member_id })
    }

    /// Return an already-committed entry, finishing the status move if it
    /// never happened
    async fn settle_existing(
        &self,
        request_id: i64,
        existing: MemberTransaction,
    ) -> Result<MemberTransaction> {
        let request = self.load(request_id).await?;
        if request.status == RequestStatus::Verified {
            warn!(request_id, entry_id = existing.id, "Repairing posted status");
            let change = StatusChange {
                request_id,
                from: RequestStatus::Verified,
                to: RequestStatus::Posted,
                actor_id: request.acted_by.unwrap_or_default(),
                at: request.acted_at.unwrap_or_else(Utc::now),
                reason: None,
            };
            self.store.transition_request(&change).await?;
        }
        Ok(existing)
    }

    pub async fn get(&self, request_id: i64) -> Result<TransactionRequest> {
        self.load(request_id).await
    }

    pub async fn proof(&self, request_id: i64) -> Result<Option<TransactionProof>> {
        self.store.get_proof(request_id).await
    }

    /// Admin queue, newest first
    pub async fn list_pending(&self, limit: Option<u32>) -> Result<Vec<TransactionRequest>> {
        let query = RequestQuery {
            limit,
            ..RequestQuery::with_status(RequestStatus::Pending)
        };
        self.store.list_requests(&query).await
    }

    pub async fn list_for_member(&self, member_id: i64) -> Result<Vec<TransactionRequest>> {
        self.store.list_requests(&RequestQuery::for_member(member_id)).await
    }

    pub async fn ledger(&self, member_id: i64) -> Result<Vec<MemberTransaction>> {
        self.store.list_ledger(member_id).await
    }

    /// Current balance, the `balance_after` of the latest entry
    pub async fn balance(&self, member_id: i64) -> Result<i64> {
        Ok(self
            .store
            .latest_ledger_entry(member_id)
            .await?
            .map_or(0, |entry| entry.balance_after))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;
    use crate::test_utils::{jpeg, FakeRecognizer, FakeStorage};

    const ADMIN: i64 = 1;

    fn service_with(
        store: Arc<MemoryStore>,
        recognizer: FakeRecognizer,
        storage: FakeStorage,
        policy: LifecyclePolicy,
    ) -> RequestService {
        store.add_user(ADMIN, "admin");
        let proofs = ProofService::new(Arc::new(recognizer), Arc::new(storage));
        RequestService::new(store, Some(proofs), policy)
    }

    fn service(store: Arc<MemoryStore>) -> RequestService {
        service_with(
            store,
            FakeRecognizer::Unavailable,
            FakeStorage::new(),
            LifecyclePolicy::default(),
        )
    }

    fn new_request(member_id: i64, amount: i64, kind: TransactionKind) -> NewRequest {
        NewRequest {
            member_id,
            amount,
            kind,
            external_reference: None,
        }
    }

    async fn verified(
        service: &RequestService,
        member_id: i64,
        amount: i64,
        kind: TransactionKind,
    ) -> i64 {
        let submitted = service
            .submit(new_request(member_id, amount, kind), Some(&jpeg()))
            .await
            .expect("submit");
        service.verify(submitted.request.id, ADMIN).await.expect("verify");
        submitted.request.id
    }

    fn assert_chain(entries: &[MemberTransaction]) {
        for pair in entries.windows(2) {
            assert_eq!(
                pair[1].balance_after,
                pair[0].balance_after + pair[1].signed_amount(),
                "entry {} does not follow entry {}",
                pair[1].id,
                pair[0].id
            );
        }
    }

    #[test]
    fn test_default_sign_table() {
        let policy = SignPolicy::default();
        assert_eq!(policy.direction(TransactionKind::Deposit), Direction::Credit);
        assert_eq!(policy.direction(TransactionKind::Withdraw), Direction::Debit);
        assert_eq!(policy.direction(TransactionKind::Repayment), Direction::Debit);
        assert_eq!(policy.direction(TransactionKind::SharePurchase), Direction::Debit);

        let flipped = SignPolicy {
            repayment_credits: true,
            ..SignPolicy::default()
        };
        assert_eq!(flipped.direction(TransactionKind::Repayment), Direction::Credit);
    }

    #[tokio::test]
    async fn test_withdrawal_end_to_end() {
        let store = Arc::new(MemoryStore::new());
        let service = service_with(
            store.clone(),
            FakeRecognizer::text("Ref: XZ9981"),
            FakeStorage::new(),
            LifecyclePolicy::default(),
        );

        store.set_next_request_id(700);
        let deposit = verified(&service, 42, 5_000, TransactionKind::Deposit).await;
        service.post(deposit).await.expect("deposit posted");

        store.set_next_request_id(777);
        let submitted = service
            .submit(new_request(42, 1_200, TransactionKind::Withdraw), Some(&jpeg()))
            .await
            .expect("submit");
        assert_eq!(submitted.request.id, 777);
        assert_eq!(submitted.request.status, RequestStatus::Pending);
        assert_eq!(submitted.request.external_reference.as_deref(), Some("XZ9981"));
        assert!(!submitted.manual_entry_required);

        let proof = submitted.proof.expect("proof stored");
        assert!(proof.storage_path.starts_with("user_42/777_"));
        assert!(proof.storage_path.ends_with(".jpg"));
        let reference = proof.reference.expect("reference extracted");
        assert_eq!(reference.value, "XZ9981");

        service.verify(777, ADMIN).await.expect("verify");
        let entry = service.post(777).await.expect("post");
        assert_eq!(entry.direction, Direction::Debit);
        assert_eq!(entry.amount, 1_200);
        assert_eq!(entry.balance_after, 3_800);
        assert_eq!(service.get(777).await.expect("get").status, RequestStatus::Posted);

        let again = service.post(777).await.expect("second post");
        assert_eq!(again, entry);
        assert_eq!(store.entry_count(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_posts_of_one_request_create_one_entry() {
        let store = Arc::new(MemoryStore::new());
        let service = Arc::new(service(store.clone()));
        let request_id = verified(&service, 9, 700, TransactionKind::Deposit).await;

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let service = service.clone();
                tokio::spawn(async move { service.post(request_id).await })
            })
            .collect();

        let mut ids = Vec::new();
        for handle in handles {
            ids.push(handle.await.expect("join").expect("post").id);
        }
        ids.dedup();
        assert_eq!(ids.len(), 1);
        assert_eq!(store.entry_count(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_posts_across_processes_keep_balance_chain() {
        let store = Arc::new(MemoryStore::new());
        // Two services share the store but not their member locks
        let first = Arc::new(service(store.clone()));
        let second = Arc::new(RequestService::new(store.clone(), None, LifecyclePolicy::default()));

        let mut request_ids = Vec::new();
        let kinds = [TransactionKind::Deposit, TransactionKind::Withdraw];
        for (i, kind) in kinds.iter().cycle().take(8).enumerate() {
            request_ids.push(verified(&first, 11, 100 * (i as i64 + 1), *kind).await);
        }

        let handles: Vec<_> = request_ids
            .iter()
            .enumerate()
            .map(|(i, &request_id)| {
                let service = if i % 2 == 0 { first.clone() } else { second.clone() };
                tokio::spawn(async move { service.post(request_id).await })
            })
            .collect();
        for handle in handles {
            handle.await.expect("join").expect("post");
        }

        let ledger = first.ledger(11).await.expect("ledger");
        assert_eq!(ledger.len(), 8);
        assert_eq!(ledger[0].balance_after, ledger[0].signed_amount());
        assert_chain(&ledger);
        let expected: i64 = ledger.iter().map(MemberTransaction::signed_amount).sum();
        assert_eq!(first.balance(11).await.expect("balance"), expected);
    }

    #[tokio::test]
    async fn test_balance_overflow_is_refused_without_appending() {
        let store = Arc::new(MemoryStore::new());
        let service = service(store.clone());
        let first = verified(&service, 5, i64::MAX, TransactionKind::Deposit).await;
        let second = verified(&service, 5, i64::MAX, TransactionKind::Deposit).await;

        service.post(first).await.expect("first post");
        let err = service.post(second).await.unwrap_err();

        assert!(matches!(err, EngineError::InvalidData(_)), "unexpected error {err:?}");
        assert_eq!(store.entry_count(), 1);
        assert_eq!(service.balance(5).await.expect("balance"), i64::MAX);
        assert_eq!(service.get(second).await.expect("get").status, RequestStatus::Verified);
    }

    #[tokio::test]
    async fn test_member_locks_are_released_after_posting() {
        let store = Arc::new(MemoryStore::new());
        let service = Arc::new(service(store.clone()));
        let mut request_ids = Vec::new();
        for member_id in 20..26 {
            request_ids.push(verified(&service, member_id, 100, TransactionKind::Deposit).await);
        }

        let handles: Vec<_> = request_ids
            .iter()
            .chain(request_ids.iter())
            .map(|&request_id| {
                let service = service.clone();
                tokio::spawn(async move { service.post(request_id).await })
            })
            .collect();
        for handle in handles {
            handle.await.expect("join").expect("post");
        }

        assert_eq!(store.entry_count(), 6);
        assert!(service.member_locks.lock().expect("locks").is_empty());
    }

    #[tokio::test]
    async fn test_failed_reference_prefill_keeps_submission() {
        let store = Arc::new(MemoryStore::new());
        let service = service_with(
            store.clone(),
            FakeRecognizer::text("TXN ID: QK71MZ0P9A"),
            FakeStorage::new(),
            LifecyclePolicy::default(),
        );

        store.fail_next_reference_update();
        let submitted = service
            .submit(new_request(14, 800, TransactionKind::Deposit), Some(&jpeg()))
            .await
            .expect("submit");

        assert!(submitted.manual_entry_required);
        assert_eq!(submitted.request.external_reference, None);
        let proof = submitted.proof.expect("proof stored");
        assert_eq!(proof.reference.expect("extracted").value, "QK71MZ0P9A");

        let listed = service.list_for_member(14).await.expect("list");
        assert_eq!(listed.len(), 1);
        assert!(service.proof(listed[0].id).await.expect("proof").is_some());
    }

    #[tokio::test]
    async fn test_retry_after_lost_ack_returns_committed_entry() {
        let store = Arc::new(MemoryStore::new());
        let service = service(store.clone());
        let request_id = verified(&service, 3, 250, TransactionKind::Deposit).await;

        store.lose_next_append_ack();
        assert!(service.post(request_id).await.is_err());

        let entry = service.post(request_id).await.expect("retry");
        assert_eq!(entry.request_id, request_id);
        assert_eq!(store.entry_count(), 1);
    }

    #[tokio::test]
    async fn test_settled_requests_refuse_disposition() {
        let store = Arc::new(MemoryStore::new());
        let service = service(store.clone());
        let verified_id = verified(&service, 4, 100, TransactionKind::Deposit).await;
        let rejected_id = service
            .submit(new_request(4, 100, TransactionKind::Deposit), Some(&jpeg()))
            .await
            .expect("submit")
            .request
            .id;
        service.reject(rejected_id, ADMIN, "blurry photo").await.expect("reject");
        let posted_id = verified(&service, 4, 100, TransactionKind::Deposit).await;
        service.post(posted_id).await.expect("post");

        for (request_id, current) in [
            (verified_id, RequestStatus::Verified),
            (rejected_id, RequestStatus::Rejected),
            (posted_id, RequestStatus::Posted),
        ] {
            let before = service.get(request_id).await.expect("get");
            for err in [
                service.verify(request_id, ADMIN).await.unwrap_err(),
                service.reject(request_id, ADMIN, "again").await.unwrap_err(),
            ] {
                assert!(
                    matches!(
                        err,
                        EngineError::InvalidTransition { current: c, .. } if c == current
                    ),
                    "unexpected error {err:?}"
                );
            }
            assert_eq!(service.get(request_id).await.expect("get"), before);
        }
    }

    #[tokio::test]
    async fn test_post_requires_verification() {
        let store = Arc::new(MemoryStore::new());
        let service = service(store.clone());
        let request_id = service
            .submit(new_request(4, 100, TransactionKind::Deposit), Some(&jpeg()))
            .await
            .expect("submit")
            .request
            .id;

        let err = service.post(request_id).await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::InvalidTransition { current: RequestStatus::Pending, .. }
        ));
        assert_eq!(store.entry_count(), 0);
    }

    #[tokio::test]
    async fn test_members_cannot_dispose() {
        let store = Arc::new(MemoryStore::new());
        let service = service(store.clone());
        store.add_user(8, "member");
        let request_id = service
            .submit(new_request(8, 100, TransactionKind::Deposit), Some(&jpeg()))
            .await
            .expect("submit")
            .request
            .id;

        let err = service.verify(request_id, 8).await.unwrap_err();
        assert!(matches!(err, EngineError::Forbidden { actor_id: 8, .. }));
        assert_eq!(service.get(request_id).await.expect("get").status, RequestStatus::Pending);
    }

    #[tokio::test]
    async fn test_failed_upload_rolls_back_submission() {
        let store = Arc::new(MemoryStore::new());
        let service = service_with(
            store.clone(),
            FakeRecognizer::text("TXN ID: QWE12345"),
            FakeStorage::failing(1),
            LifecyclePolicy::default(),
        );

        let err = service
            .submit(new_request(6, 900, TransactionKind::Deposit), Some(&jpeg()))
            .await
            .unwrap_err();

        assert!(matches!(err, EngineError::UploadFailure(_)));
        assert!(service.list_for_member(6).await.expect("list").is_empty());
    }

    #[tokio::test]
    async fn test_optional_proof_keeps_request_on_upload_failure() {
        let store = Arc::new(MemoryStore::new());
        let policy = LifecyclePolicy {
            proof_required: false,
            ..LifecyclePolicy::default()
        };
        let service = service_with(
            store.clone(),
            FakeRecognizer::Unavailable,
            FakeStorage::failing(1),
            policy,
        );

        let submitted = service
            .submit(new_request(6, 900, TransactionKind::Deposit), Some(&jpeg()))
            .await
            .expect("submit");

        assert!(submitted.proof.is_none());
        assert!(submitted.manual_entry_required);
        assert_eq!(service.list_for_member(6).await.expect("list").len(), 1);
    }

    #[tokio::test]
    async fn test_declared_reference_only_while_pending() {
        let store = Arc::new(MemoryStore::new());
        let service = service(store.clone());
        let submitted = service
            .submit(new_request(12, 300, TransactionKind::Repayment), Some(&jpeg()))
            .await
            .expect("submit");
        assert!(submitted.manual_entry_required);
        let request_id = submitted.request.id;

        let err = service.declare_reference(request_id, 99, "ab12345").await.unwrap_err();
        assert!(matches!(err, EngineError::Forbidden { actor_id: 99, .. }));

        let updated = service
            .declare_reference(request_id, 12, " ab12345 ")
            .await
            .expect("declare");
        assert_eq!(updated.external_reference.as_deref(), Some("AB12345"));

        service.verify(request_id, ADMIN).await.expect("verify");
        let err = service.declare_reference(request_id, 12, "CD67890").await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::InvalidTransition { current: RequestStatus::Verified, .. }
        ));
    }

    #[tokio::test]
    async fn test_auto_post_on_verify() {
        let store = Arc::new(MemoryStore::new());
        let policy = LifecyclePolicy {
            auto_post_on_verify: true,
            ..LifecyclePolicy::default()
        };
        let service = service_with(
            store.clone(),
            FakeRecognizer::Unavailable,
            FakeStorage::new(),
            policy,
        );
        let request_id = service
            .submit(new_request(2, 1_000, TransactionKind::Deposit), Some(&jpeg()))
            .await
            .expect("submit")
            .request
            .id;

        let request = service.verify(request_id, ADMIN).await.expect("verify");

        assert_eq!(request.status, RequestStatus::Posted);
        assert_eq!(service.balance(2).await.expect("balance"), 1_000);
    }

    #[tokio::test]
    async fn test_pending_queue_is_newest_first() {
        let store = Arc::new(MemoryStore::new());
        let service = service(store.clone());
        let mut ids = Vec::new();
        for member_id in [1, 2, 3] {
            ids.push(
                service
                    .submit(new_request(member_id, 100, TransactionKind::Deposit), Some(&jpeg()))
                    .await
                    .expect("submit")
                    .request
                    .id,
            );
        }
        service.verify(ids[1], ADMIN).await.expect("verify");

        let pending: Vec<i64> = service
            .list_pending(None)
            .await
            .expect("pending")
            .iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(pending, vec![ids[2], ids[0]]);
    }
}
