//! Member notifications behind the query cache
//!
//! Both mark-read paths update the cached list optimistically and roll back
//! if the store refuses.

use std::sync::Arc;

use tracing::info;

use crate::cache::{QueryCache, QueryKey};
use crate::db::Store;
use crate::feed::RowFilter;
use crate::models::{Notification, Table};
use crate::utils::{EngineError, Result};

pub fn notifications_key(user_id: i64) -> QueryKey {
    QueryKey::new(Table::Notifications.as_str()).with("user_id", user_id)
}

pub struct NotificationService {
    store: Arc<dyn Store>,
    cache: QueryCache<Vec<Notification>>,
}

impl NotificationService {
    pub fn new(store: Arc<dyn Store>, cache: QueryCache<Vec<Notification>>) -> Self {
        Self { store, cache }
    }

    pub fn cache(&self) -> &QueryCache<Vec<Notification>> {
        &self.cache
    }

    /// Cached list for a user, newest first. Re-fetched once stale.
    pub async fn list(&self, user_id: i64) -> Result<Vec<Notification>> {
        let store = self.store.clone();
        self.cache
            .fetch(&notifications_key(user_id), || async move {
                store.list_notifications(user_id).await
            })
            .await
    }

    pub fn unread_count(&self, user_id: i64) -> Option<usize> {
        self.cache
            .read(&notifications_key(user_id))
            .map(|cached| cached.value.iter().filter(|n| !n.is_read).count())
    }

    /// Keep the user's list in sync with the change feed
    pub fn watch(&self, user_id: i64) -> Result<()> {
        self.cache.watch(
            &notifications_key(user_id),
            Table::Notifications,
            Some(RowFilter::eq("user_id", user_id)),
        )
    }

    pub fn release(&self, user_id: i64) -> bool {
        self.cache.release(&notifications_key(user_id))
    }

    pub async fn mark_read(&self, user_id: i64, notification_id: i64) -> Result<()> {
        let store = self.store.clone();
        self.cache
            .mutate(
                &notifications_key(user_id),
                move |list: &Vec<Notification>| {
                    list.iter()
                        .cloned()
                        .map(|mut n| {
                            if n.id == notification_id {
                                n.is_read = true;
                            }
                            n
                        })
                        .collect()
                },
                move || async move {
                    if store.mark_notification_read(notification_id).await? {
                        Ok(())
                    } else {
                        Err(EngineError::NotFound {
                            entity: "Notification",
                            id: notification_id,
                        })
                    }
                },
            )
            .await
    }

    pub async fn mark_all_read(&self, user_id: i64) -> Result<u64> {
        let store = self.store.clone();
        let changed = self
            .cache
            .mutate(
                &notifications_key(user_id),
                |list: &Vec<Notification>| {
                    list.iter()
                        .cloned()
                        .map(|mut n| {
                            n.is_read = true;
                            n
                        })
                        .collect()
                },
                move || async move { store.mark_all_notifications_read(user_id).await },
            )
            .await?;

        info!(user_id, changed, "Notifications marked read");
        Ok(changed)
    }
}
