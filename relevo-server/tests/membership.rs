//! Membership and dispatch semantics.
//!
//! Tests cover:
//! - Role-hierarchy group assignment (additive upward, case-insensitive)
//! - Personal-group invariant: registered ⇔ member of user_<id>
//! - Idempotent join/leave, implicit room lifecycle
//! - No leaked membership after disconnect
//! - to_user / to_group reachability reports
//! - Per-connection delivery ordering

use std::sync::Arc;

use relevo_server::auth::{self, TokenOracle};
use relevo_server::config::ServerConfig;
use relevo_server::registry::{AuthSource, ConnectionMeta, Identity};
use relevo_server::rooms::{personal_group, role_groups};
use relevo_server::server::{RelayState, Server};
use tokio::sync::mpsc;

fn test_state() -> Arc<RelayState> {
    Server::with_oracle(
        ServerConfig::default(),
        TokenOracle::fixed(Default::default()),
    )
    .build_state()
}

fn meta() -> ConnectionMeta {
    ConnectionMeta {
        remote_addr: "10.0.0.7:55123".into(),
        user_agent: Some("test-client".into()),
        connected_at: chrono::Utc::now(),
    }
}

fn identity(user_id: &str, user_type: &str) -> Identity {
    Identity {
        user_id: user_id.into(),
        user_name: format!("Usuario {user_id}"),
        user_type: user_type.into(),
        user_email: None,
        roles: Vec::new(),
        source: AuthSource::Legacy,
        token_validated: false,
        connected_at: chrono::Utc::now(),
    }
}

/// Attach a connection and keep its receiving end.
fn attach(state: &RelayState, conn_id: &str) -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel(64);
    state.registry.attach(conn_id, tx, meta());
    rx
}

fn drain(rx: &mut mpsc::Receiver<String>) -> Vec<serde_json::Value> {
    let mut out = Vec::new();
    while let Ok(line) = rx.try_recv() {
        out.push(serde_json::from_str(&line).unwrap());
    }
    out
}

#[test]
fn admin_membership_includes_full_hierarchy() {
    let state = test_state();
    let _rx = attach(&state, "c1");
    state.registry.register("c1", identity("42", "admin"));
    state.rooms.assign_role_groups("c1", "42", "admin");

    for group in ["admins", "managers", "cobradores", "user_42"] {
        assert!(
            state.rooms.members_of(group).contains(&"c1".to_string()),
            "admin should be in {group}"
        );
    }
}

#[test]
fn super_admin_matches_case_insensitively() {
    assert_eq!(
        role_groups("Super Admin"),
        vec!["admins", "managers", "cobradores"]
    );
    assert_eq!(role_groups(" ADMIN "), role_groups("admin"));
}

#[test]
fn join_twice_leaves_single_entry() {
    let state = test_state();
    state.rooms.join("c1", "managers");
    state.rooms.join("c1", "managers");
    assert_eq!(state.rooms.members_of("managers"), vec!["c1"]);
}

#[test]
fn disconnect_leaks_no_membership() {
    let state = test_state();
    let _rx = attach(&state, "c1");
    state.registry.register("c1", identity("5", "manager"));
    state.rooms.assign_role_groups("c1", "5", "manager");
    state.rooms.join("c1", "shipment_9");

    auth::handle_disconnect(&state, "c1");

    for group in ["managers", "admins", "user_5", "shipment_9"] {
        assert!(
            !state.rooms.members_of(group).contains(&"c1".to_string()),
            "membership leaked in {group}"
        );
    }
    assert!(state.registry.lookup("c1").is_none());
    assert_eq!(state.rooms.group_count(), 0);
}

#[test]
fn to_user_reports_reachability() {
    let state = test_state();
    let mut rx = attach(&state, "c1");
    state.registry.register("c1", identity("5", "client"));
    state.rooms.join("c1", &personal_group("5"));

    assert!(state
        .dispatcher
        .to_user("5", "ping", &serde_json::json!({"n": 1})));
    assert!(!state
        .dispatcher
        .to_user("999", "ping", &serde_json::json!({})));

    let events = drain(&mut rx);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0]["event"], "ping");
    assert_eq!(events[0]["payload"]["n"], 1);
    assert!(events[0]["timestamp"].is_string());
}

#[test]
fn to_group_never_fails_on_emptiness() {
    let state = test_state();
    assert!(state
        .dispatcher
        .to_group("nonexistent_room", "x", &serde_json::json!({})));
}

#[test]
fn multi_device_user_receives_on_every_connection() {
    let state = test_state();
    let mut rx_a = attach(&state, "phone");
    let mut rx_b = attach(&state, "laptop");
    for conn in ["phone", "laptop"] {
        state.registry.register(conn, identity("5", "client"));
        state.rooms.join(conn, &personal_group("5"));
    }

    assert!(state.dispatcher.to_user("5", "hello", &serde_json::json!({})));
    assert_eq!(drain(&mut rx_a).len(), 1);
    assert_eq!(drain(&mut rx_b).len(), 1);
}

#[test]
fn broadcast_except_skips_origin() {
    let state = test_state();
    let mut rx1 = attach(&state, "c1");
    let mut rx2 = attach(&state, "c2");
    let mut rx3 = attach(&state, "c3");

    state
        .dispatcher
        .broadcast_except("c2", "user_connected", &serde_json::json!({}));

    assert_eq!(drain(&mut rx1).len(), 1);
    assert_eq!(drain(&mut rx2).len(), 0);
    assert_eq!(drain(&mut rx3).len(), 1);
}

#[test]
fn to_all_reaches_every_attached_connection() {
    // The shutdown announcement path: authenticated or not, every attached
    // connection hears a to_all event.
    let state = test_state();
    let mut rx_auth = attach(&state, "c1");
    let mut rx_guest = attach(&state, "c2");
    state.registry.register("c1", identity("5", "client"));

    state
        .dispatcher
        .to_all("server_shutdown", &serde_json::json!({"message": "bye"}));

    for rx in [&mut rx_auth, &mut rx_guest] {
        let events = drain(rx);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["event"], "server_shutdown");
    }
}

#[test]
fn per_connection_delivery_preserves_submission_order() {
    let state = test_state();
    let mut rx = attach(&state, "c1");
    state.registry.register("c1", identity("5", "client"));
    state.rooms.join("c1", &personal_group("5"));

    for n in 0..10 {
        state
            .dispatcher
            .to_user("5", "seq", &serde_json::json!({ "n": n }));
    }
    let events = drain(&mut rx);
    let seen: Vec<i64> = events
        .iter()
        .map(|e| e["payload"]["n"].as_i64().unwrap())
        .collect();
    assert_eq!(seen, (0..10).collect::<Vec<_>>());
}

#[test]
fn delivery_to_detached_connection_is_silently_dropped() {
    let state = test_state();
    let rx = attach(&state, "c1");
    state.registry.register("c1", identity("5", "client"));
    state.rooms.join("c1", &personal_group("5"));

    // Stale membership entry with no live sender: the group was non-empty
    // at delivery time so the report stays true, and the dead leg is
    // dropped without error.
    drop(rx);
    state.registry.detach("c1");
    assert!(state.dispatcher.to_user("5", "ping", &serde_json::json!({})));
}
