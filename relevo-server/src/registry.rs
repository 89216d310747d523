//! Connection registry: the source of truth for "who is currently reachable."
//!
//! Two layers per connection:
//! - **attached** — the transport session exists and has an outbox sender.
//!   Every live WebSocket is attached, authenticated or not.
//! - **registered** — an authenticated [`Identity`] is bound to the
//!   connection. Only registered connections belong to groups.
//!
//! Senders are looked up here at dispatch time, never cached by callers, so
//! a disconnect is observed immediately by the next delivery attempt.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;

/// A user id as it arrives on the wire — JSON number or string.
///
/// Every id is normalized to its string form before use; the normalized
/// string is the sole key for personal-channel addressing.
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize)]
#[serde(untagged)]
pub enum RawId {
    Num(i64),
    Text(String),
}

impl RawId {
    pub fn normalized(&self) -> String {
        match self {
            RawId::Num(n) => n.to_string(),
            RawId::Text(s) => s.trim().to_string(),
        }
    }
}

/// How the identity behind a connection was established.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthSource {
    /// Bearer token validated by the external oracle.
    Token,
    /// Legacy userId/userType handshake, no token.
    Legacy,
}

/// The authenticated principal behind a connection.
///
/// `user_id` is always the normalized (stringified) id — it is the sole key
/// for personal-channel addressing.
#[derive(Debug, Clone, Serialize)]
pub struct Identity {
    #[serde(rename = "userId")]
    pub user_id: String,
    #[serde(rename = "userName")]
    pub user_name: String,
    #[serde(rename = "userType")]
    pub user_type: String,
    #[serde(rename = "userEmail", skip_serializing_if = "Option::is_none")]
    pub user_email: Option<String>,
    pub roles: Vec<String>,
    pub source: AuthSource,
    #[serde(rename = "tokenValidated")]
    pub token_validated: bool,
    #[serde(rename = "connectedAt")]
    pub connected_at: DateTime<Utc>,
}

impl Identity {
    /// The fields broadcast to other users on connect/disconnect.
    pub fn public_fields(&self) -> serde_json::Value {
        serde_json::json!({
            "userId": self.user_id,
            "userName": self.user_name,
            "userType": self.user_type,
            "connectedAt": self.connected_at.to_rfc3339(),
        })
    }
}

/// Transport-level metadata captured when a connection attaches.
#[derive(Debug, Clone)]
pub struct ConnectionMeta {
    pub remote_addr: String,
    pub user_agent: Option<String>,
    pub connected_at: DateTime<Utc>,
}

/// Registry of live connections and their authenticated identities.
#[derive(Default)]
pub struct ConnectionRegistry {
    /// connection id -> sender for writing envelopes to that client
    senders: Mutex<HashMap<String, mpsc::Sender<String>>>,
    /// connection id -> authenticated identity (registered connections only)
    identities: Mutex<HashMap<String, Identity>>,
    /// connection id -> transport metadata
    meta: Mutex<HashMap<String, ConnectionMeta>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a freshly connected transport session. The connection is
    /// unauthenticated until [`register`](Self::register) is called.
    pub fn attach(&self, conn_id: &str, sender: mpsc::Sender<String>, meta: ConnectionMeta) {
        self.senders.lock().insert(conn_id.to_string(), sender);
        self.meta.lock().insert(conn_id.to_string(), meta);
    }

    /// Remove the transport session. Idempotent.
    pub fn detach(&self, conn_id: &str) {
        self.senders.lock().remove(conn_id);
        self.meta.lock().remove(conn_id);
    }

    /// Whether the transport session is still attached. Consulted after the
    /// handshake's oracle round trip so a disconnect cannot race a late
    /// authentication success into a phantom registration.
    pub fn is_attached(&self, conn_id: &str) -> bool {
        self.senders.lock().contains_key(conn_id)
    }

    /// Bind an identity to a connection. Idempotent per connection id;
    /// overwrites (and returns) any prior identity, which handles
    /// re-authentication on the same connection.
    pub fn register(&self, conn_id: &str, identity: Identity) -> Option<Identity> {
        self.identities
            .lock()
            .insert(conn_id.to_string(), identity)
    }

    /// Remove and return the identity bound to a connection. Returns `None`
    /// for connections that never authenticated — callers treat that as
    /// "nothing to announce," not an error.
    pub fn unregister(&self, conn_id: &str) -> Option<Identity> {
        self.identities.lock().remove(conn_id)
    }

    pub fn lookup(&self, conn_id: &str) -> Option<Identity> {
        self.identities.lock().get(conn_id).cloned()
    }

    pub fn meta(&self, conn_id: &str) -> Option<ConnectionMeta> {
        self.meta.lock().get(conn_id).cloned()
    }

    /// Snapshot of every registered identity, for connected-user stats.
    pub fn all_identities(&self) -> Vec<Identity> {
        self.identities.lock().values().cloned().collect()
    }

    /// Snapshot of (connection id, identity) pairs.
    pub fn all_entries(&self) -> Vec<(String, Identity)> {
        self.identities
            .lock()
            .iter()
            .map(|(id, identity)| (id.clone(), identity.clone()))
            .collect()
    }

    /// Current outbox sender for a connection, if it is still attached.
    pub fn sender(&self, conn_id: &str) -> Option<mpsc::Sender<String>> {
        self.senders.lock().get(conn_id).cloned()
    }

    /// Snapshot of every attached connection id.
    pub fn attached_ids(&self) -> Vec<String> {
        self.senders.lock().keys().cloned().collect()
    }

    pub fn connection_count(&self) -> usize {
        self.senders.lock().len()
    }
}
