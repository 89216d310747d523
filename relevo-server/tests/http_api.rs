//! HTTP API tests against a running server.
//!
//! Tests cover:
//! - Health endpoint shape
//! - Backend shared-secret enforcement on notify endpoints
//! - /notify and /notify/{event} classification and the sent report
//! - Connected-user stats derived from the registry

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use relevo_server::auth::TokenOracle;
use relevo_server::config::ServerConfig;
use relevo_server::registry::ConnectionMeta;
use relevo_server::server::{RelayState, Server};
use relevo_server::web;
use serde_json::{json, Value};
use tokio::sync::mpsc;

async fn start_server(backend_key: Option<String>) -> (String, Arc<RelayState>) {
    let config = ServerConfig {
        backend_key,
        ..ServerConfig::default()
    };
    let state = Server::with_oracle(config, TokenOracle::fixed(HashMap::new())).build_state();
    let app = web::router(Arc::clone(&state));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });
    (format!("http://{addr}"), state)
}

fn attach_user(state: &RelayState, conn_id: &str, user_id: &str, user_type: &str) -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel(64);
    state.registry.attach(
        conn_id,
        tx,
        ConnectionMeta {
            remote_addr: "127.0.0.1:50000".into(),
            user_agent: None,
            connected_at: chrono::Utc::now(),
        },
    );
    state.registry.register(
        conn_id,
        relevo_server::registry::Identity {
            user_id: user_id.into(),
            user_name: format!("Usuario {user_id}"),
            user_type: user_type.into(),
            user_email: None,
            roles: Vec::new(),
            source: relevo_server::registry::AuthSource::Legacy,
            token_validated: false,
            connected_at: chrono::Utc::now(),
        },
    );
    state
        .rooms
        .assign_role_groups(conn_id, user_id, user_type);
    rx
}

fn drain(rx: &mut mpsc::Receiver<String>) -> Vec<Value> {
    let mut out = Vec::new();
    while let Ok(line) = rx.try_recv() {
        out.push(serde_json::from_str(&line).unwrap());
    }
    out
}

#[tokio::test]
async fn health_reports_liveness() {
    let (base, _state) = start_server(None).await;
    let body: Value = reqwest::get(format!("{base}/api/v1/health"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["success"], true);
    assert_eq!(body["connections"], 0);
    assert!(body["timestamp"].is_string());
}

#[tokio::test]
async fn notify_requires_backend_key_when_configured() {
    let (base, _state) = start_server(Some("secreto".into())).await;
    let client = reqwest::Client::new();

    let unauthorized = client
        .post(format!("{base}/notify"))
        .json(&json!({"event": "x", "data": {}}))
        .send()
        .await
        .unwrap();
    assert_eq!(unauthorized.status(), 401);

    let authorized = client
        .post(format!("{base}/notify"))
        .header("x-backend-key", "secreto")
        .json(&json!({"event": "x", "data": {}}))
        .send()
        .await
        .unwrap();
    assert_eq!(authorized.status(), 200);
}

#[tokio::test]
async fn notify_routes_to_user_and_reports_delivery() {
    let (base, state) = start_server(None).await;
    let mut rx = attach_user(&state, "c1", "5", "client");

    let client = reqwest::Client::new();
    let body: Value = client
        .post(format!("{base}/notify"))
        .json(&json!({"event": "saldo.actualizado", "userId": 5, "data": {"saldo": 120}}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(body["success"], true);
    assert_eq!(body["sent"], true);
    assert_eq!(body["event"], "saldo.actualizado");
    assert_eq!(body["target"], "user 5");

    let events = drain(&mut rx);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0]["event"], "saldo.actualizado");
    assert_eq!(events[0]["payload"]["saldo"], 120);
}

#[tokio::test]
async fn notify_reports_unreachable_user() {
    let (base, _state) = start_server(None).await;
    let client = reqwest::Client::new();
    let body: Value = client
        .post(format!("{base}/notify"))
        .json(&json!({"event": "saldo.actualizado", "userId": 999, "data": {}}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["success"], true);
    assert_eq!(body["sent"], false);
}

#[tokio::test]
async fn notify_path_event_hits_the_proforma_matrix() {
    let (base, state) = start_server(None).await;
    let mut rx_cajero = attach_user(&state, "caj", "2", "cajero");
    let mut rx_client = attach_user(&state, "cli", "5", "client");

    let client = reqwest::Client::new();
    let body: Value = client
        .post(format!("{base}/notify/proforma-created"))
        .json(&json!({"data": {"id": 12, "numero": "PF-012", "cliente_id": 5}}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(body["event"], "proforma.creada");
    assert_eq!(body["sent"], true);

    let cajero_events = drain(&mut rx_cajero);
    assert_eq!(cajero_events.len(), 1);
    assert_eq!(cajero_events[0]["event"], "proforma.creada");

    let client_events = drain(&mut rx_client);
    assert_eq!(client_events.len(), 1);
    assert_eq!(client_events[0]["event"], "proforma_created_confirmation");
}

#[tokio::test]
async fn stats_counts_by_role() {
    let (base, state) = start_server(None).await;
    let _rx1 = attach_user(&state, "c1", "1", "manager");
    let _rx2 = attach_user(&state, "c2", "2", "manager");
    let _rx3 = attach_user(&state, "c3", "3", "cobrador");

    let body: Value = reqwest::get(format!("{base}/api/v1/stats"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(body["total"], 3);
    assert_eq!(body["by_role"]["manager"], 2);
    assert_eq!(body["by_role"]["cobrador"], 1);
    assert_eq!(body["users"].as_array().unwrap().len(), 3);

    // Disconnect one and the stats follow.
    relevo_server::auth::handle_disconnect(&state, "c3");
    let body: Value = reqwest::get(format!("{base}/api/v1/stats"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["total"], 2);
    assert!(body["by_role"].get("cobrador").is_none());
}
