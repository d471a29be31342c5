//! Notification models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Row of `notifications`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub id: i64,
    pub user_id: i64,
    pub title: String,
    pub body: String,
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
}
