//! Fan-out dispatcher: deliver an event envelope to a resolved target set.
//!
//! Senders are resolved through the registry at dispatch time — the registry
//! is the single source of truth for liveness, so delivery to a
//! since-disconnected connection is silently dropped rather than erroring.
//! Per-connection ordering is preserved by the single outbox channel; no
//! ordering is guaranteed across connections.

use std::sync::Arc;

use serde_json::Value;

use crate::registry::ConnectionRegistry;
use crate::rooms::{personal_group, Membership};
use crate::router::{Route, Target};

/// The unit delivered to clients: `{event, payload, timestamp}`.
///
/// The payload is opaque to the core — it is forwarded as-is, never
/// validated beyond presence.
pub fn envelope(event: &str, payload: &Value) -> String {
    serde_json::json!({
        "event": event,
        "payload": payload,
        "timestamp": chrono::Utc::now().to_rfc3339(),
    })
    .to_string()
}

/// Delivers envelopes to users, groups, and the whole population.
#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<ConnectionRegistry>,
    rooms: Arc<Membership>,
}

impl Dispatcher {
    pub fn new(registry: Arc<ConnectionRegistry>, rooms: Arc<Membership>) -> Self {
        Self { registry, rooms }
    }

    fn deliver(&self, conn_id: &str, line: &str) -> bool {
        match self.registry.sender(conn_id) {
            Some(tx) => {
                if tx.try_send(line.to_string()).is_err() {
                    tracing::warn!(%conn_id, "Outbox full or closed, dropping delivery");
                    false
                } else {
                    true
                }
            }
            // Disconnected between membership snapshot and delivery.
            None => false,
        }
    }

    /// Deliver directly to one connection (confirmations, error replies).
    pub fn to_connection(&self, conn_id: &str, event: &str, payload: &Value) -> bool {
        self.deliver(conn_id, &envelope(event, payload))
    }

    /// Deliver to every connection of a user's personal group.
    ///
    /// Returns `true` iff the group was non-empty at delivery time — a
    /// best-effort reachability report, not a durable ack.
    pub fn to_user(&self, user_id: &str, event: &str, payload: &Value) -> bool {
        let group = personal_group(user_id);
        let members = self.rooms.members_of(&group);
        if members.is_empty() {
            tracing::debug!(%group, %event, "No live connections for user");
            return false;
        }
        let line = envelope(event, payload);
        for conn_id in &members {
            self.deliver(conn_id, &line);
        }
        true
    }

    /// Deliver to every member of a group. Fire-and-forget: an empty group
    /// is not an error, so this always reports `true`.
    pub fn to_group(&self, group: &str, event: &str, payload: &Value) -> bool {
        let line = envelope(event, payload);
        for conn_id in self.rooms.members_of(group) {
            self.deliver(&conn_id, &line);
        }
        true
    }

    /// Deliver to every attached connection, authenticated or not.
    pub fn to_all(&self, event: &str, payload: &Value) {
        let line = envelope(event, payload);
        for conn_id in self.registry.attached_ids() {
            self.deliver(&conn_id, &line);
        }
    }

    /// Deliver to every attached connection except the origin. Used for
    /// peer-notification events like `user_connected`.
    pub fn broadcast_except(&self, origin_conn_id: &str, event: &str, payload: &Value) {
        let line = envelope(event, payload);
        for conn_id in self.registry.attached_ids() {
            if conn_id != origin_conn_id {
                self.deliver(&conn_id, &line);
            }
        }
    }

    /// Execute a routing decision. Returns the best-effort `sent` report:
    /// true if any group/broadcast leg ran or any personal leg reached a
    /// live connection.
    pub fn execute(&self, routes: &[Route]) -> bool {
        let mut sent = false;
        for route in routes {
            match &route.target {
                Target::User(user_id) => {
                    sent |= self.to_user(user_id, &route.event, &route.payload);
                }
                Target::Group(group) => {
                    self.to_group(group, &route.event, &route.payload);
                    sent = true;
                }
                Target::All => {
                    self.to_all(&route.event, &route.payload);
                    sent = true;
                }
            }
        }
        sent
    }
}
