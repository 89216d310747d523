//! Room membership: named groups of connections used as fan-out targets.
//!
//! Membership is an explicit multimap (group name -> set of connection ids).
//! There is no separate "room exists" state — a group whose last member
//! leaves disappears from the map, and joining a group that never existed
//! creates it.
//!
//! Group kinds:
//! - personal `user_<id>` — exactly the connections owned by one identity
//! - role `<roletype>s` — populated via [`assign_role_groups`](Membership::assign_role_groups)
//! - ad-hoc `shipment_<id>` / `driver_<id>` — joined and left around a
//!   tracking session's lifetime

use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;

/// The personal group name for a normalized user id.
pub fn personal_group(user_id: &str) -> String {
    format!("user_{user_id}")
}

/// Role groups for a user type, applying the additive hierarchy rule.
///
/// Membership is additive upward, not exclusive: managers also sit in the
/// admins room, admins also sit in managers and cobradores. Matching is
/// case-insensitive and trimmed. Unrecognized types fall back to naive
/// pluralization and are logged — delivery keeps working, classification
/// may be wrong.
pub fn role_groups(user_type: &str) -> Vec<String> {
    let normalized = user_type.trim().to_lowercase();
    match normalized.as_str() {
        "cobrador" => vec!["cobradores".into()],
        "client" => vec!["clients".into()],
        "manager" => vec!["managers".into(), "admins".into()],
        "admin" | "super admin" => {
            vec!["admins".into(), "managers".into(), "cobradores".into()]
        }
        "cajero" => vec!["cajeros".into()],
        "preventista" => vec!["preventistas".into()],
        "logistica" => vec!["logisticas".into()],
        other => {
            tracing::warn!(user_type = %other, "Unrecognized user type, using pluralized fallback group");
            vec![format!("{other}s")]
        }
    }
}

/// Connection -> group associations.
#[derive(Default)]
pub struct Membership {
    groups: Mutex<HashMap<String, HashSet<String>>>,
}

impl Membership {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection to a group. Idempotent.
    pub fn join(&self, conn_id: &str, group: &str) {
        self.groups
            .lock()
            .entry(group.to_string())
            .or_default()
            .insert(conn_id.to_string());
    }

    /// Remove a connection from a group. Idempotent; removes the group
    /// entry entirely when its last member leaves.
    pub fn leave(&self, conn_id: &str, group: &str) {
        let mut groups = self.groups.lock();
        if let Some(members) = groups.get_mut(group) {
            members.remove(conn_id);
            if members.is_empty() {
                groups.remove(group);
            }
        }
    }

    /// Snapshot of the members of a group at call time.
    pub fn members_of(&self, group: &str) -> Vec<String> {
        self.groups
            .lock()
            .get(group)
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Snapshot of the groups a connection belongs to.
    pub fn groups_of(&self, conn_id: &str) -> Vec<String> {
        self.groups
            .lock()
            .iter()
            .filter(|(_, members)| members.contains(conn_id))
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Remove a connection from every group it is in, returning the groups
    /// it vacated. Used on disconnect and re-authentication so no stale
    /// membership survives the registry entry.
    pub fn leave_all(&self, conn_id: &str) -> Vec<String> {
        let mut groups = self.groups.lock();
        let mut vacated = Vec::new();
        groups.retain(|name, members| {
            if members.remove(conn_id) {
                vacated.push(name.clone());
            }
            !members.is_empty()
        });
        vacated
    }

    /// Join the role groups for `user_type` plus the personal group for
    /// `user_id`. Returns the joined group names.
    pub fn assign_role_groups(&self, conn_id: &str, user_id: &str, user_type: &str) -> Vec<String> {
        let mut joined = role_groups(user_type);
        joined.push(personal_group(user_id));
        for group in &joined {
            self.join(conn_id, group);
        }
        joined
    }

    pub fn group_count(&self) -> usize {
        self.groups.lock().len()
    }
}
