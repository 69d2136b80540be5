//! Durable inbox entries.
//!
//! A row is written only when the recipient has no subscribed live
//! session at send time. Entries persist until explicitly dismissed;
//! draining the inbox on subscribe is a non-destructive read.

use super::Database;
use crate::wire::UserNotification;
use anyhow::Result;

#[derive(sqlx::FromRow)]
struct NotificationRow {
    id: String,
    subject: String,
    contents: String,
    from_name: String,
    link: String,
    notification_type: String,
    timestamp_unix_sec: i64,
}

impl NotificationRow {
    fn into_msg(self) -> UserNotification {
        UserNotification {
            id: self.id,
            subject: self.subject,
            contents: self.contents,
            from: self.from_name,
            link: self.link,
            timestamp_unix_sec: self.timestamp_unix_sec,
            notification_type: self.notification_type,
        }
    }
}

impl Database {
    pub async fn insert_notification(
        &self,
        dest_user_id: &str,
        notification: &UserNotification,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO notifications (id, dest_user_id, subject, contents, from_name,
                 link, notification_type, timestamp_unix_sec)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
             ON CONFLICT (id) DO NOTHING",
        )
        .bind(&notification.id)
        .bind(dest_user_id)
        .bind(&notification.subject)
        .bind(&notification.contents)
        .bind(&notification.from)
        .bind(&notification.link)
        .bind(&notification.notification_type)
        .bind(notification.timestamp_unix_sec)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_notifications(&self, user_id: &str) -> Result<Vec<UserNotification>> {
        let rows = sqlx::query_as::<_, NotificationRow>(
            "SELECT id, subject, contents, from_name, link, notification_type,
                    timestamp_unix_sec
             FROM notifications WHERE dest_user_id = $1
             ORDER BY timestamp_unix_sec",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(NotificationRow::into_msg).collect())
    }

    /// Idempotent: deleting an unknown id is not an error.
    pub async fn dismiss_notification(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM notifications WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn count_notifications(&self, user_id: &str) -> Result<i64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM notifications WHERE dest_user_id = $1")
                .bind(user_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }
}
