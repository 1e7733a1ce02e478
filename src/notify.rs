// ===============================
// src/notify.rs (viewer notification hub)
// ===============================
//
// Satu antrian keluar per klien viewer (key = user_id). Transport (WebSocket)
// hanya mengonsumsi receiver-nya; hub tidak tahu apa-apa soal socket.
//
use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::domain::{EnforcementMessage, WsMessage};
use crate::keyed::ShardedMap;
use crate::metrics::{ENFORCEMENTS, WS_CLIENTS};

pub const CLIENT_BUFFER: usize = 256;

#[derive(Clone)]
struct Client {
    session: u64,
    tx: mpsc::Sender<String>,
}

pub struct NotificationHub {
    clients: ShardedMap<Client>,
    next_session: AtomicU64,
}

impl Default for NotificationHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotificationHub {
    pub fn new() -> Self {
        Self { clients: ShardedMap::new(), next_session: AtomicU64::new(1) }
    }

    /// Register a viewer. A newer session for the same id replaces the older
    /// one; the old receiver then sees its channel close.
    pub fn add_client(&self, id: &str) -> (u64, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(CLIENT_BUFFER);
        let session = self.next_session.fetch_add(1, Ordering::Relaxed);
        if self.clients.insert(id, Client { session, tx }).is_some() {
            debug!(client = id, "viewer session replaced");
        }
        WS_CLIENTS.set(self.client_count() as i64);
        (session, rx)
    }

    /// Remove `id` only if it is still owned by `session`.
    pub fn remove_client(&self, id: &str, session: u64) -> bool {
        let removed = self.clients.remove_if(id, |c| c.session == session).is_some();
        WS_CLIENTS.set(self.client_count() as i64);
        removed
    }

    /// Deliver one envelope to one viewer. No-op when not connected.
    pub fn send(&self, id: &str, msg: &WsMessage) -> bool {
        let Some(client) = self.clients.get(id) else {
            return false;
        };
        let text = match serde_json::to_string(msg) {
            Ok(t) => t,
            Err(e) => {
                warn!(?e, client = id, "viewer message encode failed");
                return false;
            }
        };
        match client.tx.try_send(text) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(client = id, "viewer buffer full, message dropped");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    pub fn send_enforcement(&self, msg: &EnforcementMessage) {
        let envelope = WsMessage {
            kind: "enforcement".to_string(),
            data: json!({
                "user_id": msg.user_id,
                "action": msg.action,
                "reason": msg.reason,
                "severity": msg.severity,
                "timestamp": msg.timestamp,
            }),
        };
        let outcome = if self.send(&msg.user_id, &envelope) { "sent" } else { "skipped" };
        ENFORCEMENTS.with_label_values(&["ws", outcome]).inc();
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn enforcement_reaches_only_the_target_viewer() {
        let hub = NotificationHub::new();
        let (_s1, mut rx1) = hub.add_client("u1");
        let (_s2, mut rx2) = hub.add_client("u2");

        hub.send_enforcement(&EnforcementMessage::new("u1", "close_position", "Rule violation: big", 4));

        let text = rx1.recv().await.unwrap();
        let v: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(v["type"], "enforcement");
        assert_eq!(v["data"]["action"], "close_position");
        assert_eq!(v["data"]["severity"], 4);
        assert!(rx2.try_recv().is_err());
    }

    #[test]
    fn send_to_unknown_client_is_silent() {
        let hub = NotificationHub::new();
        let msg = WsMessage { kind: "pong".into(), data: serde_json::Value::Null };
        assert!(!hub.send("nobody", &msg));
    }

    #[test]
    fn stale_session_cannot_remove_newer_one() {
        let hub = NotificationHub::new();
        let (old, _rx_old) = hub.add_client("u1");
        let (new, _rx_new) = hub.add_client("u1");
        assert_eq!(hub.client_count(), 1);
        assert!(!hub.remove_client("u1", old));
        assert_eq!(hub.client_count(), 1);
        assert!(hub.remove_client("u1", new));
        assert_eq!(hub.client_count(), 0);
    }

    #[test]
    fn full_buffer_drops_instead_of_blocking() {
        let hub = NotificationHub::new();
        let (_s, _rx) = hub.add_client("slow");
        let msg = WsMessage { kind: "tick".into(), data: serde_json::Value::Null };
        for _ in 0..CLIENT_BUFFER {
            assert!(hub.send("slow", &msg));
        }
        assert!(!hub.send("slow", &msg));
    }
}
