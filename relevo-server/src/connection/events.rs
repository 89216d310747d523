//! Client-originated event handlers.
//!
//! Everything except `authenticate` requires a registered identity: an
//! unauthenticated sender gets an error reply and no dispatch happens.
//! Role-restricted events (`location_update` for cobradores,
//! `driver_location_update` for choferes) additionally check the sender's
//! user type.

use serde_json::{json, Value};

use crate::auth::{self, AuthError, AuthRequest};
use crate::registry::{Identity, RawId};
use crate::router::{self, with_fields, RoutingHint};
use crate::server::RelayState;

pub async fn dispatch_client_event(
    state: &RelayState,
    conn_id: &str,
    event: &str,
    data: Value,
) {
    if event == "authenticate" {
        handle_authenticate(state, conn_id, data).await;
        return;
    }

    // Everything below is authentication-gated.
    let Some(user) = state.registry.lookup(conn_id) else {
        tracing::debug!(%conn_id, %event, "Event from unauthenticated connection ignored");
        let error_event = match event {
            "location_update" | "driver_location_update" => "location_update_error",
            _ => "error",
        };
        state.dispatcher.to_connection(
            conn_id,
            error_event,
            &json!({
                "success": false,
                "event": event,
                "message": "Debes autenticarte antes de enviar eventos",
            }),
        );
        return;
    };

    match event {
        "location_update" => handle_location_update(state, conn_id, &user, data),
        "driver_location_update" => handle_driver_location_update(state, conn_id, &user, data),
        "send_message" => handle_send_message(state, &user, data),
        "payment_update" => handle_payment_update(state, &user, data),
        "shipment_scheduled"
        | "shipment_preparation_started"
        | "shipment_departed"
        | "shipment_arriving_soon"
        | "shipment_delivered"
        | "shipment_delivery_failed"
        | "vehicle_status_changed"
        | "route_event" => handle_shipment_event(state, conn_id, &user, event, data),
        other => {
            tracing::debug!(%conn_id, event = %other, "Unknown client event");
            state.dispatcher.to_connection(
                conn_id,
                "error",
                &json!({
                    "success": false,
                    "event": other,
                    "message": "Evento no reconocido",
                }),
            );
        }
    }
}

async fn handle_authenticate(state: &RelayState, conn_id: &str, data: Value) {
    let request: AuthRequest = serde_json::from_value(data).unwrap_or_default();
    match auth::authenticate(state, conn_id, request).await {
        Ok(outcome) => {
            let identity = &outcome.identity;
            state.dispatcher.to_connection(
                conn_id,
                "authenticated",
                &json!({
                    "success": true,
                    "message": "Autenticación exitosa",
                    "userId": identity.user_id,
                    "userName": identity.user_name,
                    "userType": identity.user_type,
                    "userEmail": identity.user_email,
                    "roles": identity.roles,
                    "tokenValidated": identity.token_validated,
                    "authMethod": outcome.auth_method,
                }),
            );
        }
        // The connection is gone; nobody is left to reply to.
        Err(AuthError::ConnectionClosed) => {}
        Err(e) => {
            tracing::info!(%conn_id, code = e.code(), "Authentication rejected");
            state.dispatcher.to_connection(
                conn_id,
                "authentication_error",
                &json!({
                    "success": false,
                    "message": e.to_string(),
                    "code": e.code(),
                }),
            );
        }
    }
}

/// Cobrador position update, relayed to the admins room.
fn handle_location_update(state: &RelayState, conn_id: &str, user: &Identity, data: Value) {
    if !user.user_type.eq_ignore_ascii_case("cobrador") {
        state.dispatcher.to_connection(
            conn_id,
            "location_update_error",
            &json!({
                "success": false,
                "message": "Solo los cobradores pueden actualizar su ubicación",
            }),
        );
        return;
    }
    let payload = with_fields(
        &data,
        &[
            ("cobradorId", user.user_id.clone().into()),
            ("cobradorName", user.user_name.clone().into()),
        ],
    );
    state
        .dispatcher
        .to_group("admins", "cobrador_location_update", &payload);
}

/// Driver GPS ping while on route: personal to the shipment's client plus
/// the managers room.
fn handle_driver_location_update(state: &RelayState, conn_id: &str, user: &Identity, data: Value) {
    if !user.user_type.eq_ignore_ascii_case("chofer") {
        state.dispatcher.to_connection(
            conn_id,
            "location_update_error",
            &json!({
                "success": false,
                "message": "Solo los choferes pueden actualizar su ubicación",
            }),
        );
        return;
    }
    let payload = with_fields(&data, &[("chofer_id", user.user_id.clone().into())]);
    let routing = router::classify("driver_location_update", &payload, &RoutingHint::default());
    state.dispatcher.execute(&routing.routes);
    state.dispatcher.to_connection(
        conn_id,
        "location_update_received",
        &json!({ "success": true, "message": "Ubicación actualizada" }),
    );
}

fn handle_send_message(state: &RelayState, user: &Identity, data: Value) {
    let recipient = data
        .get("recipientId")
        .and_then(|v| serde_json::from_value::<RawId>(v.clone()).ok())
        .map(|id| id.normalized());
    let Some(recipient) = recipient else {
        tracing::debug!(sender = %user.user_id, "send_message without recipientId");
        return;
    };
    let payload = json!({
        "senderId": user.user_id,
        "senderName": user.user_name,
        "message": data.get("message").cloned().unwrap_or(Value::Null),
    });
    state.dispatcher.to_user(&recipient, "new_message", &payload);
}

/// Payment recorded by a cobrador: echo to the cobrador's own devices and
/// surface to managers.
fn handle_payment_update(state: &RelayState, user: &Identity, data: Value) {
    let from = json!({
        "id": user.user_id,
        "name": user.user_name,
        "type": user.user_type,
    });
    let cobrador_id = data
        .get("cobradorId")
        .and_then(|v| serde_json::from_value::<RawId>(v.clone()).ok())
        .map(|id| id.normalized())
        .unwrap_or_else(|| user.user_id.clone());
    let payload = with_fields(
        &data,
        &[
            ("type", "payment_update".into()),
            ("cobradorId", cobrador_id.clone().into()),
            ("from", from),
        ],
    );
    state
        .dispatcher
        .to_user(&cobrador_id, "payment_received", &payload);
    state
        .dispatcher
        .to_group("managers", "cobrador_payment_received", &payload);
}

/// Shipment lifecycle events share a shape: confirm to the sender, fan out
/// per the router, and maintain the ad-hoc tracking rooms around the
/// departure → delivery window.
fn handle_shipment_event(
    state: &RelayState,
    conn_id: &str,
    user: &Identity,
    event: &str,
    data: Value,
) {
    let routing = router::classify(event, &data, &RoutingHint::default());
    state.dispatcher.execute(&routing.routes);

    let notice: router::ShipmentNotice = serde_json::from_value(data.clone()).unwrap_or_default();
    match event {
        "shipment_departed" => {
            // The driver follows this shipment until it is delivered.
            if let Some(shipment) = notice.shipment_key() {
                state.rooms.join(conn_id, &format!("shipment_{shipment}"));
            }
            if let Some(driver) = notice.driver_id() {
                state.rooms.join(conn_id, &format!("driver_{driver}"));
            }
        }
        "shipment_delivered" => {
            if let Some(shipment) = notice.shipment_key() {
                state.rooms.leave(conn_id, &format!("shipment_{shipment}"));
            }
            state
                .rooms
                .leave(conn_id, &format!("driver_{}", user.user_id));
        }
        _ => {}
    }

    state.dispatcher.to_connection(
        conn_id,
        &format!("{event}_confirmed"),
        &json!({
            "success": true,
            "shipment_id": notice.shipment_key(),
            "numero_envio": notice.numero_envio,
            "event": routing.canonical,
        }),
    );
}
