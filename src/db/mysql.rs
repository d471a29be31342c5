//! MySQL-backed [`Store`]
//!
//! Change events come from the `change_log` triggers, not from this type, so
//! writes made by other processes reach the feed the same way ours do.

use async_trait::async_trait;
use sqlx::mysql::MySqlPool;

use super::{ledger, notification, proof, request, user, RequestQuery, StatusChange, Store};
use crate::models::{
    MemberTransaction, NewLedgerEntry, NewRequest, Notification, TransactionProof,
    TransactionRequest,
};
use crate::utils::{EngineError, Result};

#[derive(Clone)]
pub struct MySqlStore {
    pool: MySqlPool,
}

impl MySqlStore {
    pub fn new(pool: MySqlPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &MySqlPool {
        &self.pool
    }
}

#[async_trait]
impl Store for MySqlStore {
    async fn insert_request(&self, new: &NewRequest) -> Result<TransactionRequest> {
        let id = request::create_request(&self.pool, new).await?;
        request::get_request(&self.pool, id)
            .await?
            .ok_or(EngineError::NotFound { entity: "Request", id })
    }

    async fn get_request(&self, request_id: i64) -> Result<Option<TransactionRequest>> {
        Ok(request::get_request(&self.pool, request_id).await?)
    }

    async fn list_requests(&self, query: &RequestQuery) -> Result<Vec<TransactionRequest>> {
        Ok(request::list_requests(&self.pool, query).await?)
    }

    async fn set_declared_reference(&self, request_id: i64, reference: &str) -> Result<bool> {
        Ok(request::set_external_reference(&self.pool, request_id, reference).await?)
    }

    async fn delete_pending_request(&self, request_id: i64) -> Result<bool> {
        Ok(request::delete_pending_request(&self.pool, request_id).await?)
    }

    async fn transition_request(
        &self,
        change: &StatusChange,
    ) -> Result<Option<TransactionRequest>> {
        if !request::update_status(&self.pool, change).await? {
            return Ok(None);
        }
        let updated = request::get_request(&self.pool, change.request_id)
            .await?
            .ok_or(EngineError::NotFound {
                entity: "Request",
                id: change.request_id,
            })?;
        Ok(Some(updated))
    }

    async fn insert_proof(&self, proof: &TransactionProof) -> Result<()> {
        Ok(proof::create_proof(&self.pool, proof).await?)
    }

    async fn get_proof(&self, request_id: i64) -> Result<Option<TransactionProof>> {
        Ok(proof::get_proof(&self.pool, request_id).await?)
    }

    async fn latest_ledger_entry(&self, member_id: i64) -> Result<Option<MemberTransaction>> {
        Ok(ledger::get_latest_entry(&self.pool, member_id).await?)
    }

    async fn ledger_entry_for_request(
        &self,
        request_id: i64,
    ) -> Result<Option<MemberTransaction>> {
        Ok(ledger::get_entry_by_request(&self.pool, request_id).await?)
    }

    async fn list_ledger(&self, member_id: i64) -> Result<Vec<MemberTransaction>> {
        Ok(ledger::get_member_entries(&self.pool, member_id).await?)
    }

    async fn append_ledger_entry(&self, entry: &NewLedgerEntry) -> Result<MemberTransaction> {
        ledger::append_entry(&self.pool, entry).await
    }

    async fn user_role(&self, user_id: i64) -> Result<Option<String>> {
        Ok(user::get_user_role(&self.pool, user_id).await?)
    }

    async fn list_notifications(&self, user_id: i64) -> Result<Vec<Notification>> {
        Ok(notification::get_user_notifications(&self.pool, user_id).await?)
    }

    async fn mark_notification_read(&self, notification_id: i64) -> Result<bool> {
        if notification::get_notification_owner(&self.pool, notification_id)
            .await?
            .is_none()
        {
            return Ok(false);
        }
        // Zero affected rows just means it was already read
        notification::mark_read(&self.pool, notification_id).await?;
        Ok(true)
    }

    async fn mark_all_notifications_read(&self, user_id: i64) -> Result<u64> {
        Ok(notification::mark_all_read(&self.pool, user_id).await?)
    }
}
