use sqlx::mysql::MySqlPool;

/// Get a user's role name ("admin", "member", ...)
pub async fn get_user_role(pool: &MySqlPool, user_id: i64) -> Result<Option<String>, sqlx::Error> {
    sqlx::query_scalar("SELECT role FROM users WHERE id = ?")
        .bind(user_id)
        .fetch_optional(pool)
        .await
}
