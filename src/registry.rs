//!
//! Realtime connection registry
//! ----------------------------
//! Owns every live per-user duplex channel and is the sole mutator of the
//! user-id -> connection table. Feature code pushes through it; it never
//! queues or retries — push delivery is fire-and-forget.
//!
//! Responsibilities:
//! - At most one live connection per user id; a second device displaces the first.
//! - Per-connection two-phase inactivity timeout: a silent budget, then a
//!   warned grace period, then forced sign-out and close.
//! - Recognized control messages ("ping", "refresh") reset the inactivity
//!   timer; unrecognized traffic is logged and does not.
//! - Best-effort push primitives (`send`, `send_to_many`, notification fan-out).
//!
//! All table mutations — register, remove, timer restart, expiry — serialize
//! through one async mutex. Timer tasks are cancelled cooperatively at their
//! sleep points, and every timer action re-validates its registration under
//! the table lock, so a cancel can never race a simultaneous expiry.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::{Mutex, Notify};
use tokio::time;
use tracing::{debug, info};

use crate::identity::{Principal, UserId};

pub const CLOSE_NORMAL: u16 = 1000;
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;

// Wire tags understood by the client.
const TYPE_COMMAND: u8 = 0;
const TYPE_NOTIFICATION: u8 = 1;
const TYPE_EXPIRES: u8 = 3;

/// Outbound envelope pushed over a connection.
#[derive(Debug, Clone, PartialEq)]
pub enum PushMessage {
    /// Response to a client command, e.g. ping -> pong.
    Command { command: String },
    /// A batch of opaque notification payloads.
    Notifications { notifications: Vec<serde_json::Value> },
    /// The session is about to expire unless the client acts.
    SessionExpiring { seconds_remaining: u64 },
}

impl PushMessage {
    pub fn to_json(&self) -> String {
        match self {
            PushMessage::Command { command } => {
                json!({"type": TYPE_COMMAND, "command": command})
            }
            PushMessage::Notifications { notifications } => {
                json!({"type": TYPE_NOTIFICATION, "notifications": notifications})
            }
            PushMessage::SessionExpiring { seconds_remaining } => {
                json!({"type": TYPE_EXPIRES, "sessionExpiresInSeconds": seconds_remaining})
            }
        }
        .to_string()
    }
}

/// A notification addressed to one user. Persisting for guaranteed delivery
/// is the sender's job; the registry only attempts the live push.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub user_id: UserId,
    pub title: String,
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deep_link: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

/// Duplex channel abstraction the registry owns. The server provides a
/// WebSocket-backed implementation; tests provide recording fakes.
/// Send and close are best-effort from the registry's point of view.
pub trait Channel: Send + Sync + 'static {
    fn send_text(&self, text: String) -> impl Future<Output = anyhow::Result<()>> + Send;
    fn close(&self, code: u16) -> impl Future<Output = ()> + Send;
    fn is_closed(&self) -> bool;
}

/// The registry's hook back into the session authority when a timed-out
/// connection forces a sign-out. Infallible at this boundary — teardown must
/// always complete.
pub trait SessionInvalidator: Send + Sync {
    fn invalidate(&self, user_id: UserId);
}

/// `Connecting` is the pre-registration handshake phase (owned by the
/// transport layer); entries enter the table as `Active`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Active,
    WarningIssued,
    Closing,
    Closed,
}

struct Connection<C> {
    conn_id: u64,
    principal: Principal,
    channel: Arc<C>,
    state: ConnectionState,
    /// Cancellation handle of the currently-running timeout task. Replaced on
    /// every activity event; a timer whose handle no longer matches is stale.
    cancel: Arc<Notify>,
}

pub struct ConnectionRegistry<C: Channel> {
    connections: Mutex<HashMap<UserId, Connection<C>>>,
    invalidator: Arc<dyn SessionInvalidator>,
    inactivity_budget: Duration,
    warning_lead: Duration,
    next_conn_id: AtomicU64,
}

impl<C: Channel> ConnectionRegistry<C> {
    pub fn new(
        invalidator: Arc<dyn SessionInvalidator>,
        inactivity_budget: Duration,
        warning_lead: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            connections: Mutex::new(HashMap::new()),
            invalidator,
            inactivity_budget,
            warning_lead,
            next_conn_id: AtomicU64::new(1),
        })
    }

    /// Take ownership of a freshly-opened channel for this principal and
    /// start its inactivity protocol. Any existing connection for the same
    /// user is torn down first. Returns the registration id the transport
    /// loop passes back to `remove_if_current` on close.
    pub async fn register(self: &Arc<Self>, channel: C, principal: Principal) -> u64 {
        let user_id = principal.user.id;
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let cancel = Arc::new(Notify::new());

        let mut table = self.connections.lock().await;
        if let Some(old) = table.remove(&user_id) {
            info!("displacing existing connection for user ({user_id})");
            old.cancel.notify_one();
            old.channel.close(CLOSE_NORMAL).await;
        }
        table.insert(
            user_id,
            Connection {
                conn_id,
                principal,
                channel: Arc::new(channel),
                state: ConnectionState::Active,
                cancel: cancel.clone(),
            },
        );
        drop(table);

        self.spawn_timeout(user_id, conn_id, cancel);
        info!("registered realtime connection for user ({user_id})");
        conn_id
    }

    /// Handle an inbound text message. Returns true when it was a recognized
    /// control message (and the inactivity timer was reset).
    pub async fn handle_message(self: &Arc<Self>, user_id: UserId, text: &str) -> bool {
        match text {
            "ping" => {
                self.record_activity(user_id).await;
                self.send(user_id, &PushMessage::Command { command: "pong".into() })
                    .await;
                true
            }
            "refresh" => {
                self.record_activity(user_id).await;
                true
            }
            other => {
                // Malformed traffic must not be usable to keep a session alive.
                debug!("unrecognized message on connection for user ({user_id}): ({other})");
                false
            }
        }
    }

    /// Reset the inactivity clock: cancel the running timeout task and start
    /// a fresh one. The replacement of the cancel handle and the table state
    /// happen under the same lock the timer validates against.
    pub async fn record_activity(self: &Arc<Self>, user_id: UserId) {
        let mut table = self.connections.lock().await;
        let Some(conn) = table.get_mut(&user_id) else {
            return;
        };
        if matches!(conn.state, ConnectionState::Closing | ConnectionState::Closed) {
            return;
        }
        conn.cancel.notify_one();
        let cancel = Arc::new(Notify::new());
        conn.cancel = cancel.clone();
        conn.state = ConnectionState::Active;
        let conn_id = conn.conn_id;
        drop(table);

        self.spawn_timeout(user_id, conn_id, cancel);
    }

    /// Best-effort push to one user. Silently a no-op without a live,
    /// non-closing connection; send failures are swallowed.
    pub async fn send(&self, user_id: UserId, message: &PushMessage) {
        let table = self.connections.lock().await;
        let Some(conn) = table.get(&user_id) else {
            return;
        };
        if matches!(conn.state, ConnectionState::Closing | ConnectionState::Closed)
            || conn.channel.is_closed()
        {
            return;
        }
        if let Err(e) = conn.channel.send_text(message.to_json()).await {
            debug!("push to user ({user_id}) failed: {e}");
        }
    }

    /// Best-effort push to many users.
    pub async fn send_to_many(&self, messages: impl IntoIterator<Item = (UserId, PushMessage)>) {
        for (user_id, message) in messages {
            self.send(user_id, &message).await;
        }
    }

    /// Fan a batch of notifications out to their addressees, one envelope per
    /// connected user.
    pub async fn send_notifications(&self, notifications: Vec<Notification>) {
        let mut by_user: HashMap<UserId, Vec<serde_json::Value>> = HashMap::new();
        for n in notifications {
            let user_id = n.user_id;
            if let Ok(payload) = serde_json::to_value(&n) {
                by_user.entry(user_id).or_default().push(payload);
            }
        }
        for (user_id, notifications) in by_user {
            self.send(user_id, &PushMessage::Notifications { notifications })
                .await;
        }
    }

    /// Cancel the timeout task and close the channel if still open. Safe to
    /// call multiple times.
    pub async fn close_connection(&self, user_id: UserId) {
        let mut table = self.connections.lock().await;
        if let Some(conn) = table.remove(&user_id) {
            conn.cancel.notify_one();
            if !conn.channel.is_closed() {
                conn.channel.close(CLOSE_NORMAL).await;
            }
        }
    }

    /// Cleanup when the transport loop observes the channel closed, whichever
    /// side initiated it. Only removes the entry when it is still the same
    /// registration.
    pub async fn remove_if_current(&self, user_id: UserId, conn_id: u64) {
        let mut table = self.connections.lock().await;
        let current = matches!(table.get(&user_id), Some(c) if c.conn_id == conn_id);
        if current {
            if let Some(conn) = table.remove(&user_id) {
                conn.cancel.notify_one();
            }
        }
    }

    pub async fn is_connected(&self, user_id: UserId) -> bool {
        self.connections.lock().await.contains_key(&user_id)
    }

    /// The principal a live connection is bound to, if any.
    pub async fn connected_principal(&self, user_id: UserId) -> Option<Principal> {
        self.connections
            .lock()
            .await
            .get(&user_id)
            .map(|c| c.principal.clone())
    }

    pub async fn connection_state(&self, user_id: UserId) -> Option<ConnectionState> {
        self.connections.lock().await.get(&user_id).map(|c| c.state)
    }

    fn spawn_timeout(self: &Arc<Self>, user_id: UserId, conn_id: u64, cancel: Arc<Notify>) {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            registry.timeout_protocol(user_id, conn_id, cancel).await;
        });
    }

    /// The two-phase inactivity protocol. One instance runs per connection;
    /// activity cancels it and starts a fresh instance. Both sleeps observe
    /// cancellation, and both follow-up actions verify under the table lock
    /// that this instance is still the registered one.
    async fn timeout_protocol(self: Arc<Self>, user_id: UserId, conn_id: u64, cancel: Arc<Notify>) {
        let silent = self.inactivity_budget.saturating_sub(self.warning_lead);
        let cancelled = cancel.notified();
        tokio::pin!(cancelled);

        // Phase 1: the silent budget.
        tokio::select! {
            _ = &mut cancelled => return,
            _ = time::sleep(silent) => {}
        }

        // Warn the client, carrying the remaining grace period.
        {
            let mut table = self.connections.lock().await;
            let Some(conn) = table.get_mut(&user_id) else {
                return;
            };
            if conn.conn_id != conn_id || !Arc::ptr_eq(&conn.cancel, &cancel) {
                return;
            }
            conn.state = ConnectionState::WarningIssued;
            let warning = PushMessage::SessionExpiring {
                seconds_remaining: self.warning_lead.as_secs(),
            };
            if let Err(e) = conn.channel.send_text(warning.to_json()).await {
                debug!("failed to push expiry warning to user ({user_id}): {e}");
            }
        }

        // Phase 2: the warned grace period.
        tokio::select! {
            _ = &mut cancelled => return,
            _ = time::sleep(self.warning_lead) => {}
        }

        // Expired with no intervening activity: sign out, close, remove.
        let mut table = self.connections.lock().await;
        let current = matches!(
            table.get(&user_id),
            Some(c) if c.conn_id == conn_id && Arc::ptr_eq(&c.cancel, &cancel)
        );
        if !current {
            return;
        }
        if let Some(mut conn) = table.remove(&user_id) {
            conn.state = ConnectionState::Closing;
            drop(table);
            info!("closing connection for user ({user_id}) after inactivity timeout");
            self.invalidator.invalidate(user_id);
            conn.channel.close(CLOSE_POLICY_VIOLATION).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_wire_shapes() {
        let pong = PushMessage::Command { command: "pong".into() };
        assert_eq!(
            serde_json::from_str::<serde_json::Value>(&pong.to_json()).unwrap(),
            json!({"type": 0, "command": "pong"})
        );

        let expiring = PushMessage::SessionExpiring { seconds_remaining: 60 };
        assert_eq!(
            serde_json::from_str::<serde_json::Value>(&expiring.to_json()).unwrap(),
            json!({"type": 3, "sessionExpiresInSeconds": 60})
        );

        let batch = PushMessage::Notifications {
            notifications: vec![json!({"title": "hi"})],
        };
        assert_eq!(
            serde_json::from_str::<serde_json::Value>(&batch.to_json()).unwrap(),
            json!({"type": 1, "notifications": [{"title": "hi"}]})
        );
    }

    #[test]
    fn notification_payload_uses_camel_case() {
        let n = Notification {
            user_id: 7,
            title: "Friend request".into(),
            body: "eve wants to be your friend".into(),
            deep_link: Some("app://friends".into()),
            metadata: None,
        };
        let v = serde_json::to_value(&n).unwrap();
        assert_eq!(v["userId"], 7);
        assert_eq!(v["deepLink"], "app://friends");
        assert!(v.get("metadata").is_none());
    }
}
