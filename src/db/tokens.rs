//! Single-use connect tokens for the socket upgrade.
//!
//! The upgrade request can't re-present credentials in some client
//! stacks, so the authenticated `/ws-connect` call mints a short-lived
//! token capturing the principal. Consuming a token deletes it together
//! with every expired token in one statement.

use super::Database;
use anyhow::Result;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectTokenRecord {
    pub id: String,
    pub expiry_unix_sec: i64,
    pub user_id: String,
    pub user_name: String,
    pub email: String,
    pub permissions: Vec<String>,
}

#[derive(sqlx::FromRow)]
struct TokenRow {
    id: String,
    expiry_unix_sec: i64,
    user_id: String,
    user_name: String,
    email: String,
    permissions: serde_json::Value,
}

impl TokenRow {
    fn into_record(self) -> ConnectTokenRecord {
        ConnectTokenRecord {
            id: self.id,
            expiry_unix_sec: self.expiry_unix_sec,
            user_id: self.user_id,
            user_name: self.user_name,
            email: self.email,
            permissions: serde_json::from_value(self.permissions).unwrap_or_default(),
        }
    }
}

impl Database {
    /// Store a fresh token and sweep any already-expired ones.
    pub async fn create_connect_token(
        &self,
        token: &ConnectTokenRecord,
        now_unix: i64,
    ) -> Result<()> {
        sqlx::query("DELETE FROM connect_tokens WHERE expiry_unix_sec < $1")
            .bind(now_unix)
            .execute(&self.pool)
            .await?;
        sqlx::query(
            "INSERT INTO connect_tokens (id, expiry_unix_sec, user_id, user_name, email,
                 permissions)
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(&token.id)
        .bind(token.expiry_unix_sec)
        .bind(&token.user_id)
        .bind(&token.user_name)
        .bind(&token.email)
        .bind(serde_json::json!(token.permissions))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Single-use consume. Returns the captured principal when the token
    /// exists and has not expired; the token (and all expired tokens)
    /// are gone afterwards either way.
    pub async fn consume_connect_token(
        &self,
        token_id: &str,
        now_unix: i64,
    ) -> Result<Option<ConnectTokenRecord>> {
        let row = sqlx::query_as::<_, TokenRow>(
            "DELETE FROM connect_tokens
             WHERE id = $1 OR expiry_unix_sec < $2
             RETURNING id, expiry_unix_sec, user_id, user_name, email, permissions",
        )
        .bind(token_id)
        .bind(now_unix)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .find(|r| r.id == token_id);
        Ok(row
            .map(TokenRow::into_record)
            .filter(|r| r.expiry_unix_sec >= now_unix))
    }
}
