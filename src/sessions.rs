//! Live session registry.
//!
//! One entry per open socket. Each session owns an unbounded outbound
//! queue drained by its socket task, so senders never block the
//! dispatch loop. The registry is the cross-session directory used by
//! the notification router; lookups are linear scans over live
//! sessions.

use crate::lock_or_recover;
use crate::wire::WsMessage;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

/// Verified identity attached to a session at upgrade time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Principal {
    pub user_id: String,
    pub name: String,
    pub email: String,
    pub permissions: Vec<String>,
}

struct Session {
    user: Principal,
    notification_subscribed: bool,
    tx: mpsc::UnboundedSender<WsMessage>,
}

#[derive(Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, Session>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session; returns the outbound receiver for the socket
    /// task to drain.
    pub fn attach(
        &self,
        session_id: &str,
        user: Principal,
    ) -> mpsc::UnboundedReceiver<WsMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        debug!(session_id, user_id = %user.user_id, "session attached");
        lock_or_recover(&self.sessions).insert(
            session_id.to_string(),
            Session {
                user,
                notification_subscribed: false,
                tx,
            },
        );
        rx
    }

    pub fn detach(&self, session_id: &str) {
        debug!(session_id, "session detached");
        lock_or_recover(&self.sessions).remove(session_id);
    }

    pub fn session_count(&self) -> usize {
        lock_or_recover(&self.sessions).len()
    }

    /// A session is subscribed once it sends its first
    /// notification-subscribe request; the flag never resets within a
    /// session's lifetime.
    pub fn set_subscribed(&self, session_id: &str) {
        if let Some(s) = lock_or_recover(&self.sessions).get_mut(session_id) {
            s.notification_subscribed = true;
        }
    }

    pub fn user_of(&self, session_id: &str) -> Option<Principal> {
        lock_or_recover(&self.sessions)
            .get(session_id)
            .map(|s| s.user.clone())
    }

    pub fn send_to_session(&self, session_id: &str, msg: WsMessage) {
        if let Some(s) = lock_or_recover(&self.sessions).get(session_id) {
            // receiver gone means the socket task is tearing down
            let _ = s.tx.send(msg);
        }
    }

    /// Deliver to every subscribed session whose user is in `user_ids`;
    /// returns the user ids with no such session.
    pub fn broadcast_to_subscribed_users(
        &self,
        user_ids: &[String],
        msg: &WsMessage,
    ) -> Vec<String> {
        let sessions = lock_or_recover(&self.sessions);
        let mut covered: HashSet<&str> = HashSet::new();
        for s in sessions.values() {
            if s.notification_subscribed && user_ids.iter().any(|u| *u == s.user.user_id) {
                let _ = s.tx.send(msg.clone());
                covered.insert(s.user.user_id.as_str());
            }
        }
        user_ids
            .iter()
            .filter(|u| !covered.contains(u.as_str()))
            .cloned()
            .collect()
    }

    /// Deliver to all subscribed sessions regardless of user.
    pub fn broadcast_to_subscribed(&self, msg: &WsMessage) {
        let sessions = lock_or_recover(&self.sessions);
        for s in sessions.values() {
            if s.notification_subscribed {
                let _ = s.tx.send(msg.clone());
            }
        }
    }

    /// Session ids bound to any of `user_ids`, plus the user ids with no
    /// live session at all.
    pub fn sessions_for_users(&self, user_ids: &[String]) -> (Vec<String>, Vec<String>) {
        let sessions = lock_or_recover(&self.sessions);
        let mut found = Vec::new();
        let mut covered: HashSet<&str> = HashSet::new();
        for (id, s) in sessions.iter() {
            if user_ids.iter().any(|u| *u == s.user.user_id) {
                found.push(id.clone());
                covered.insert(s.user.user_id.as_str());
            }
        }
        let missing = user_ids
            .iter()
            .filter(|u| !covered.contains(u.as_str()))
            .cloned()
            .collect();
        (found, missing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{SysEvent, Update};

    fn principal(user_id: &str) -> Principal {
        Principal {
            user_id: user_id.to_string(),
            name: user_id.to_string(),
            email: format!("{}@example.com", user_id),
            permissions: Vec::new(),
        }
    }

    #[test]
    fn broadcast_skips_unsubscribed_sessions() {
        let reg = SessionRegistry::new();
        let mut rx1 = reg.attach("s1", principal("u1"));
        let mut rx2 = reg.attach("s2", principal("u2"));
        reg.set_subscribed("s1");

        let users = vec!["u1".to_string(), "u2".to_string(), "u3".to_string()];
        let msg = WsMessage::Update(Update::SysNotify(SysEvent::QuantChanged));
        let uncovered = reg.broadcast_to_subscribed_users(&users, &msg);

        assert!(rx1.try_recv().is_ok());
        assert!(rx2.try_recv().is_err());
        let mut uncovered = uncovered;
        uncovered.sort();
        assert_eq!(uncovered, vec!["u2".to_string(), "u3".to_string()]);
    }

    #[test]
    fn sessions_for_users_reports_missing() {
        let reg = SessionRegistry::new();
        let _rx = reg.attach("s1", principal("u1"));
        let (found, missing) = reg.sessions_for_users(&[
            "u1".to_string(),
            "u9".to_string(),
        ]);
        assert_eq!(found, vec!["s1".to_string()]);
        assert_eq!(missing, vec!["u9".to_string()]);
    }

    #[test]
    fn detach_removes_session() {
        let reg = SessionRegistry::new();
        let _rx = reg.attach("s1", principal("u1"));
        assert_eq!(reg.session_count(), 1);
        reg.detach("s1");
        assert_eq!(reg.session_count(), 0);
    }
}
