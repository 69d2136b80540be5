//! # Notification router
//!
//! Two channels. Per-user messages go to every subscribed live session
//! of the target users; users with no such session get a durable inbox
//! row instead. System events are fire-and-forget broadcasts to all
//! subscribed sessions. Email fan-out is wrapped in a handler election
//! so it happens once across the fleet no matter how many instances
//! observed the trigger.

use crate::db::Database;
use crate::elector;
use crate::sessions::SessionRegistry;
use crate::wire::{SysEvent, Update, UserNotification, WsMessage};
use anyhow::Result;
use std::sync::Arc;
use tracing::{info, warn};

pub trait Mailer: Send + Sync {
    fn send(&self, to_email: &str, subject: &str, body: &str);
}

/// Default mailer: log-only. Deployments bind a real sender.
pub struct LogMailer;

impl Mailer for LogMailer {
    fn send(&self, to_email: &str, subject: &str, body: &str) {
        info!(to = to_email, subject, body_len = body.len(), "email send");
    }
}

#[derive(Clone)]
pub struct NotificationRouter {
    db: Database,
    sessions: Arc<SessionRegistry>,
    mailer: Arc<dyn Mailer>,
    instance_id: String,
}

impl NotificationRouter {
    pub fn new(
        db: Database,
        sessions: Arc<SessionRegistry>,
        mailer: Arc<dyn Mailer>,
        instance_id: String,
    ) -> Self {
        NotificationRouter {
            db,
            sessions,
            mailer,
            instance_id,
        }
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    /// Deliver to live subscribed sessions; write an inbox row for each
    /// uncovered user. Inbox ids are `<base>-<destUserId>` so per-user
    /// dismissal works on a shared base id.
    pub async fn send_notification(
        &self,
        user_ids: &[String],
        mut notification: UserNotification,
    ) -> Result<()> {
        notification.timestamp_unix_sec = crate::now_unix();
        let msg = WsMessage::Update(Update::Notification(notification.clone()));
        let uncovered = self.sessions.broadcast_to_subscribed_users(user_ids, &msg);
        for user_id in &uncovered {
            let mut inbox = notification.clone();
            inbox.id = format!("{}-{}", notification.id, user_id);
            self.db.insert_notification(user_id, &inbox).await?;
        }
        info!(
            total = user_ids.len(),
            queued = uncovered.len(),
            subject = %notification.subject,
            "notification routed"
        );
        Ok(())
    }

    /// Email once across the fleet, keyed by the triggering object id.
    pub async fn send_email_once(
        &self,
        source_id: &str,
        to_email: String,
        subject: String,
        body: String,
    ) -> Result<()> {
        let mailer = Arc::clone(&self.mailer);
        elector::handle_once(&self.db, source_id, &self.instance_id, move || async move {
            mailer.send(&to_email, &subject, &body);
        })
        .await?;
        Ok(())
    }

    /// Lightweight cache-invalidation broadcast; never persists, never
    /// emails.
    pub fn sys_notify(&self, event: SysEvent) {
        self.sessions
            .broadcast_to_subscribed(&WsMessage::Update(Update::SysNotify(event)));
    }

    pub async fn dismiss(&self, id: &str) -> Result<()> {
        self.db.dismiss_notification(id).await
    }

    /// First subscribe of a session's lifetime: flag it and drain the
    /// user's pending inbox to that session. The read is
    /// non-destructive; rows persist until dismissed.
    pub async fn subscribe_session(&self, session_id: &str, user_id: &str) -> Result<()> {
        self.sessions.set_subscribed(session_id);
        let pending = match self.db.list_notifications(user_id).await {
            Ok(p) => p,
            Err(e) => {
                warn!(user_id, error = %e, "inbox drain failed");
                return Ok(());
            }
        };
        for n in pending {
            self.sessions
                .send_to_session(session_id, WsMessage::Update(Update::Notification(n)));
        }
        Ok(())
    }
}
