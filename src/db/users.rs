//! User records, created lazily on first socket attach.

use super::Database;
use anyhow::Result;
use serde::Serialize;

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct UserRecord {
    pub user_id: String,
    pub name: String,
    pub email: String,
    pub created_unix_sec: i64,
}

impl Database {
    pub async fn get_user(&self, user_id: &str) -> Result<Option<UserRecord>> {
        let row = sqlx::query_as::<_, UserRecord>(
            "SELECT user_id, name, email, created_unix_sec FROM users WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Fetch the user record, creating it on first sight. Name and email
    /// come from the verified principal.
    pub async fn get_or_create_user(
        &self,
        user_id: &str,
        name: &str,
        email: &str,
        now_unix: i64,
    ) -> Result<UserRecord> {
        let row = sqlx::query_as::<_, UserRecord>(
            "INSERT INTO users (user_id, name, email, created_unix_sec)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (user_id) DO UPDATE SET name = EXCLUDED.name, email = EXCLUDED.email
             RETURNING user_id, name, email, created_unix_sec",
        )
        .bind(user_id)
        .bind(name)
        .bind(email)
        .bind(now_unix)
        .fetch_one(&self.pool)
        .await?;
        Ok(row)
    }
}
