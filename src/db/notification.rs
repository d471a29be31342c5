use sqlx::mysql::MySqlPool;
use sqlx::Row;

use crate::models::Notification;

/// Get all notifications for a user, newest first
pub async fn get_user_notifications(
    pool: &MySqlPool,
    user_id: i64,
) -> Result<Vec<Notification>, sqlx::Error> {
    let rows = sqlx::query(
        "SELECT id, user_id, title, body, is_read, created_at FROM notifications \
         WHERE user_id = ? ORDER BY created_at DESC, id DESC"
    )
    .bind(user_id)
    .fetch_all(pool)
    .await?;

    rows.iter()
        .map(|r| -> Result<Notification, sqlx::Error> {
            Ok(Notification {
                id: r.try_get("id")?,
                user_id: r.try_get("user_id")?,
                title: r.try_get("title")?,
                body: r.try_get("body")?,
                is_read: r.try_get("is_read")?,
                created_at: r.try_get("created_at")?,
            })
        })
        .collect()
}

/// Mark one notification read
pub async fn mark_read(pool: &MySqlPool, notification_id: i64) -> Result<bool, sqlx::Error> {
    let result = sqlx::query("UPDATE notifications SET is_read = TRUE WHERE id = ?")
        .bind(notification_id)
        .execute(pool)
        .await?;

    Ok(result.rows_affected() == 1)
}

/// Mark every unread notification of a user read
pub async fn mark_all_read(pool: &MySqlPool, user_id: i64) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE notifications SET is_read = TRUE WHERE user_id = ? AND is_read = FALSE",
    )
    .bind(user_id)
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

/// Get the owner of a notification
pub async fn get_notification_owner(
    pool: &MySqlPool,
    notification_id: i64,
) -> Result<Option<i64>, sqlx::Error> {
    sqlx::query_scalar("SELECT user_id FROM notifications WHERE id = ?")
        .bind(notification_id)
        .fetch_optional(pool)
        .await
}
