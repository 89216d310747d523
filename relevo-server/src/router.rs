//! Event router: classify inbound relay requests and resolve fan-out targets.
//!
//! `classify` is total: every raw event name resolves to a canonical event
//! and a target list. Backend integrations have accumulated naming variants
//! for the same business event (`notify/proforma-created`,
//! `proforma.creada`, ...) — the router normalizes them instead of treating
//! them as distinct events. Requests nothing matches fall back by priority
//! userId > userType > broadcast-all; the broadcast default is deliberate
//! and logged, never a silent drop.
//!
//! Routing decisions read only the identifier fields they need from the
//! payload; the payload itself is forwarded opaquely (enriched with the
//! same `tipo`/`prioridad`/message fields the backend contract expects).

use serde::Deserialize;
use serde_json::Value;

use crate::registry::RawId;

/// A resolved fan-out target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    User(String),
    Group(String),
    All,
}

/// One delivery: an event name, a target, and the payload to send.
#[derive(Debug, Clone)]
pub struct Route {
    pub event: String,
    pub target: Target,
    pub payload: Value,
}

/// The routing decision for one inbound request.
#[derive(Debug)]
pub struct Routing {
    /// Canonical event name after variant normalization.
    pub canonical: String,
    pub routes: Vec<Route>,
    /// False when no canonical rule matched and the fallback chain decided.
    pub matched: bool,
}

/// Extra addressing carried beside the payload (`userId`/`userType` at the
/// top level of a notify request). Consulted only by the fallback chain.
#[derive(Debug, Default, Clone)]
pub struct RoutingHint {
    pub user_id: Option<String>,
    pub user_type: Option<String>,
}

// ── Typed routing fields ───────────────────────────────────────────────
//
// Each notice struct parses just the fields a routing decision needs.
// Everything is optional: a missing id simply drops that leg of the
// fan-out, it never fails the request.

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ProformaNotice {
    pub cliente_id: Option<RawId>,
    pub items: Option<Vec<Value>>,
}

impl ProformaNotice {
    fn client_id(&self) -> Option<String> {
        self.cliente_id.as_ref().map(RawId::normalized)
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct DeliveryNotice {
    pub chofer_id: Option<RawId>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct EstadoNotice {
    pub estado_nuevo: Option<EstadoRef>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct EstadoRef {
    pub codigo: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct PersonRef {
    pub id: Option<RawId>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ShipmentNotice {
    pub id: Option<RawId>,
    pub shipment_id: Option<RawId>,
    pub numero_envio: Option<String>,
    pub cliente_id: Option<RawId>,
    pub chofer_id: Option<RawId>,
    pub chofer: Option<PersonRef>,
    pub tipo_evento: Option<String>,
}

impl ShipmentNotice {
    pub fn client_id(&self) -> Option<String> {
        self.cliente_id.as_ref().map(RawId::normalized)
    }

    /// Driver id from either the flat field or the nested `chofer` object.
    pub fn driver_id(&self) -> Option<String> {
        self.chofer_id
            .as_ref()
            .map(RawId::normalized)
            .or_else(|| self.chofer.as_ref().and_then(|c| c.id.as_ref().map(RawId::normalized)))
    }

    pub fn shipment_key(&self) -> Option<String> {
        self.id
            .as_ref()
            .or(self.shipment_id.as_ref())
            .map(RawId::normalized)
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct PaymentNotice {
    pub cobrador_id: Option<RawId>,
}

/// Canonical business events, after resolving naming variants.
#[derive(Debug)]
pub enum CanonicalEvent {
    ProformaCreated(ProformaNotice),
    ProformaApproved(ProformaNotice),
    ProformaRejected(ProformaNotice),
    ProformaConverted(ProformaNotice),
    ClientProformaConverted(ProformaNotice),
    StockReserved(ProformaNotice),
    ReservationExpiring(ProformaNotice),
    DeliveryAssigned(DeliveryNotice),
    DeliveryArrivalConfirmed,
    DeliveryConfirmed,
    DeliveryIssueReported,
    DeliveryStateChanged(EstadoNotice),
    DeliveryInTransit,
    DeliveryCompleted,
    DeliveryProblem,
    DeliveryLocation,
    PaymentReceived(PaymentNotice),
    ShipmentScheduled(ShipmentNotice),
    ShipmentPreparationStarted(ShipmentNotice),
    ShipmentDeparted(ShipmentNotice),
    DriverLocation(ShipmentNotice),
    ShipmentArriving(ShipmentNotice),
    ShipmentDelivered(ShipmentNotice),
    ShipmentDeliveryFailed(ShipmentNotice),
    VehicleStatusChanged,
    RouteEvent(ShipmentNotice),
}

impl CanonicalEvent {
    pub fn name(&self) -> &'static str {
        use CanonicalEvent::*;
        match self {
            ProformaCreated(_) => "proforma.creada",
            ProformaApproved(_) => "proforma.aprobada",
            ProformaRejected(_) => "proforma.rechazada",
            ProformaConverted(_) => "proforma.convertida",
            ClientProformaConverted(_) => "cliente.proforma.convertida",
            StockReserved(_) => "proforma.stock_reservado",
            ReservationExpiring(_) => "proforma.reserva_venciendo",
            DeliveryAssigned(_) => "entrega:asignada",
            DeliveryArrivalConfirmed => "entrega:llegada-confirmada",
            DeliveryConfirmed => "entrega:confirmada",
            DeliveryIssueReported => "entrega:novedad-reportada",
            DeliveryStateChanged(_) => "entrega:estado_cambio",
            DeliveryInTransit => "entrega:en_transito",
            DeliveryCompleted => "entrega:entregada",
            DeliveryProblem => "entrega:problema",
            DeliveryLocation => "entrega:ubicacion",
            PaymentReceived(_) => "payment_received",
            ShipmentScheduled(_) => "shipment_scheduled",
            ShipmentPreparationStarted(_) => "shipment_preparation_started",
            ShipmentDeparted(_) => "shipment_departed",
            DriverLocation(_) => "driver_location_update",
            ShipmentArriving(_) => "shipment_arriving_soon",
            ShipmentDelivered(_) => "shipment_delivered",
            ShipmentDeliveryFailed(_) => "shipment_delivery_failed",
            VehicleStatusChanged => "vehicle_status_changed",
            RouteEvent(_) => "route_event",
        }
    }
}

/// Normalize a raw event name: trim, lowercase, strip the `notify/` prefix.
fn normalize_event(raw: &str) -> String {
    let name = raw.trim().to_lowercase();
    name.strip_prefix("notify/").unwrap_or(&name).to_string()
}

fn parse<T: Default + for<'de> Deserialize<'de>>(payload: &Value) -> T {
    serde_json::from_value(payload.clone()).unwrap_or_default()
}

/// Resolve a raw event name to a canonical event. `None` means the
/// fallback chain decides.
fn canonicalize(raw: &str, payload: &Value) -> Option<CanonicalEvent> {
    use CanonicalEvent::*;
    let event = match normalize_event(raw).as_str() {
        "proforma-created" | "proforma.creada" => ProformaCreated(parse(payload)),
        "proforma-approved" | "proforma.aprobada" => ProformaApproved(parse(payload)),
        "proforma-rejected" | "proforma.rechazada" => ProformaRejected(parse(payload)),
        "proforma-converted" | "proforma.convertida" => ProformaConverted(parse(payload)),
        "cliente-proforma-converted" => ClientProformaConverted(parse(payload)),
        "stock-reserved" => StockReserved(parse(payload)),
        "reservation-expiring" => ReservationExpiring(parse(payload)),
        "entrega-asignada" | "entrega.asignada" => DeliveryAssigned(parse(payload)),
        "entrega.llegada-confirmada" => DeliveryArrivalConfirmed,
        "entrega.confirmada" => DeliveryConfirmed,
        "entrega.novedad-reportada" => DeliveryIssueReported,
        "entrega.estado_cambio" => DeliveryStateChanged(parse(payload)),
        "entrega.en_transito" => DeliveryInTransit,
        "entrega.entregada" => DeliveryCompleted,
        "entrega.problema" => DeliveryProblem,
        "entrega.ubicacion" => DeliveryLocation,
        "payment-received" | "payment_update" => PaymentReceived(parse(payload)),
        "shipment_scheduled" => ShipmentScheduled(parse(payload)),
        "shipment_preparation_started" => ShipmentPreparationStarted(parse(payload)),
        "shipment_departed" => ShipmentDeparted(parse(payload)),
        "driver_location_update" => DriverLocation(parse(payload)),
        "shipment_arriving_soon" => ShipmentArriving(parse(payload)),
        "shipment_delivered" => ShipmentDelivered(parse(payload)),
        "shipment_delivery_failed" => ShipmentDeliveryFailed(parse(payload)),
        "vehicle_status_changed" => VehicleStatusChanged,
        "route_event" => RouteEvent(parse(payload)),
        _ => return None,
    };
    Some(event)
}

/// Delivery-state priority: states with live GPS are high, terminal states
/// medium, scheduling states low.
pub fn priority_for_state(code: &str) -> &'static str {
    match code {
        "EN_TRANSITO" | "EN_CAMINO" | "LLEGO" => "high",
        "ENTREGADO" | "ENTREGADA" => "medium",
        "PROGRAMADO" | "ASIGNADA" | "CANCELADA" => "low",
        _ => "medium",
    }
}

// ── Payload shaping ────────────────────────────────────────────────────

/// Clone the payload and merge extra fields into it. Non-object payloads
/// are wrapped under `data` first so the merge always has somewhere to go.
pub(crate) fn with_fields(payload: &Value, fields: &[(&str, Value)]) -> Value {
    let mut base = match payload {
        Value::Object(map) => Value::Object(map.clone()),
        other => serde_json::json!({ "data": other }),
    };
    if let Some(obj) = base.as_object_mut() {
        for (key, value) in fields {
            obj.insert((*key).to_string(), value.clone());
        }
    }
    base
}

fn with_message(payload: &Value, message: &str, kind: &str) -> Value {
    with_fields(
        payload,
        &[("message", message.into()), ("type", kind.into())],
    )
}

fn group_routes(groups: &[&str], event: &str, payload: &Value) -> Vec<Route> {
    groups
        .iter()
        .map(|group| Route {
            event: event.to_string(),
            target: Target::Group((*group).to_string()),
            payload: payload.clone(),
        })
        .collect()
}

fn user_route(user_id: String, event: &str, payload: Value) -> Route {
    Route {
        event: event.to_string(),
        target: Target::User(user_id),
        payload,
    }
}

fn all_route(event: &str, payload: Value) -> Route {
    Route {
        event: event.to_string(),
        target: Target::All,
        payload,
    }
}

impl CanonicalEvent {
    /// The fan-out for this event.
    ///
    /// Proforma dedup policy: professionals receive via their role rooms
    /// only; the personal leg targets the owning *client* exclusively,
    /// keyed by `cliente_id`. The same user is never addressed both ways.
    fn routes(&self, payload: &Value) -> Vec<Route> {
        use CanonicalEvent::*;
        let event = self.name();
        match self {
            ProformaCreated(notice) => {
                let mut routes = group_routes(
                    &["preventistas", "cajeros", "managers", "admins"],
                    event,
                    payload,
                );
                if let Some(client) = notice.client_id() {
                    let items_count = notice.items.as_ref().map(Vec::len).unwrap_or(0);
                    let confirmation = with_fields(
                        payload,
                        &[
                            ("items_count", items_count.into()),
                            ("message", "Tu pedido ha sido recibido y está en revisión".into()),
                            ("type", "success".into()),
                        ],
                    );
                    routes.push(user_route(client, "proforma_created_confirmation", confirmation));
                }
                routes
            }
            ProformaApproved(notice) => {
                let mut routes =
                    group_routes(&["preventistas", "managers", "admins"], event, payload);
                if let Some(client) = notice.client_id() {
                    let personal =
                        with_message(payload, "Tu proforma ha sido aprobada", "success");
                    routes.push(user_route(client, event, personal));
                }
                routes
            }
            ProformaRejected(notice) => {
                let mut routes =
                    group_routes(&["preventistas", "managers", "admins"], event, payload);
                if let Some(client) = notice.client_id() {
                    let personal = with_message(payload, "Tu proforma ha sido rechazada", "error");
                    routes.push(user_route(client, event, personal));
                }
                routes
            }
            ProformaConverted(notice) => {
                let mut routes = group_routes(
                    &["logisticas", "cobradores", "managers", "admins"],
                    event,
                    payload,
                );
                if let Some(client) = notice.client_id() {
                    let personal =
                        with_message(payload, "Tu proforma se convirtió en venta", "success");
                    routes.push(user_route(client, event, personal));
                }
                routes
            }
            ClientProformaConverted(notice) => match notice.client_id() {
                Some(client) => {
                    let personal = with_message(
                        payload,
                        "Tu proforma se convirtió en venta",
                        "success",
                    );
                    vec![user_route(client, "proforma.convertida", personal)]
                }
                None => {
                    tracing::warn!("Client proforma conversion without cliente_id, nothing to send");
                    Vec::new()
                }
            },
            StockReserved(_) | ReservationExpiring(_) => {
                group_routes(&["managers", "admins"], event, payload)
            }
            DeliveryAssigned(notice) => {
                let mut routes = Vec::new();
                if let Some(driver) = notice.chofer_id.as_ref().map(RawId::normalized) {
                    let personal = with_fields(
                        payload,
                        &[
                            (
                                "mensaje",
                                "Se te ha asignado una nueva entrega consolidada. Inicia la carga de mercadería.".into(),
                            ),
                            ("type", "success".into()),
                            ("notificationType", "entrega_consolidada_asignada".into()),
                        ],
                    );
                    routes.push(user_route(driver, event, personal));
                }
                let oversight =
                    with_fields(payload, &[("tipo", "entrega_consolidada_asignada".into())]);
                routes.extend(group_routes(&["admins", "logisticas"], event, &oversight));
                routes
            }
            DeliveryArrivalConfirmed => vec![all_route(
                event,
                with_fields(
                    payload,
                    &[("tipo", "entrega_action".into()), ("accion", "chofer_llego".into())],
                ),
            )],
            DeliveryConfirmed => vec![all_route(
                event,
                with_fields(
                    payload,
                    &[
                        ("tipo", "entrega_action".into()),
                        ("accion", "entrega_confirmada".into()),
                    ],
                ),
            )],
            DeliveryIssueReported => vec![all_route(
                event,
                with_fields(
                    payload,
                    &[
                        ("tipo", "entrega_action".into()),
                        ("accion", "novedad_reportada".into()),
                        ("prioridad", "high".into()),
                    ],
                ),
            )],
            DeliveryStateChanged(notice) => {
                let priority = notice
                    .estado_nuevo
                    .as_ref()
                    .and_then(|e| e.codigo.as_deref())
                    .map(priority_for_state)
                    .unwrap_or("medium");
                vec![all_route(
                    event,
                    with_fields(
                        payload,
                        &[("tipo", "entrega_estado".into()), ("prioridad", priority.into())],
                    ),
                )]
            }
            DeliveryInTransit | DeliveryLocation => vec![all_route(
                event,
                with_fields(
                    payload,
                    &[("tipo", "entrega_tracking".into()), ("prioridad", "high".into())],
                ),
            )],
            DeliveryCompleted => vec![all_route(
                event,
                with_fields(
                    payload,
                    &[("tipo", "entrega_estado".into()), ("prioridad", "medium".into())],
                ),
            )],
            DeliveryProblem => vec![all_route(
                event,
                with_fields(
                    payload,
                    &[("tipo", "entrega_estado".into()), ("prioridad", "high".into())],
                ),
            )],
            PaymentReceived(notice) => {
                let mut routes = Vec::new();
                if let Some(cobrador) = notice.cobrador_id.as_ref().map(RawId::normalized) {
                    routes.push(user_route(cobrador, "payment_received", payload.clone()));
                }
                routes.extend(group_routes(
                    &["managers"],
                    "cobrador_payment_received",
                    payload,
                ));
                routes
            }
            ShipmentScheduled(notice) => {
                let mut routes = Vec::new();
                if let Some(client) = notice.client_id() {
                    let personal = with_message(
                        payload,
                        "Tu pedido ha sido programado para envío",
                        "info",
                    );
                    routes.push(user_route(client, event, personal));
                }
                routes.extend(group_routes(&["managers"], "new_shipment_scheduled", payload));
                if let Some(driver) = notice.driver_id() {
                    let personal = with_message(
                        payload,
                        "Tienes un nuevo envío asignado",
                        "info",
                    );
                    routes.push(user_route(driver, "new_shipment_assigned", personal));
                }
                routes
            }
            ShipmentPreparationStarted(notice) => {
                let mut routes = Vec::new();
                if let Some(client) = notice.client_id() {
                    let personal = with_message(
                        payload,
                        "Tu pedido está siendo preparado en el almacén",
                        "info",
                    );
                    routes.push(user_route(client, event, personal));
                }
                routes.extend(group_routes(&["managers"], event, payload));
                routes
            }
            ShipmentDeparted(notice) => {
                let mut routes = Vec::new();
                if let Some(client) = notice.client_id() {
                    let personal =
                        with_message(payload, "Tu pedido está en ruta", "success");
                    routes.push(user_route(client, event, personal));
                }
                routes.extend(group_routes(
                    &["managers"],
                    "shipment_departed_notification",
                    payload,
                ));
                if let Some(driver) = notice.driver_id() {
                    let personal = with_message(
                        payload,
                        "Salida confirmada. Dirígete al cliente",
                        "success",
                    );
                    routes.push(user_route(driver, "confirmed_departed", personal));
                }
                routes
            }
            DriverLocation(notice) => {
                let mut routes = Vec::new();
                if let Some(client) = notice.client_id() {
                    routes.push(user_route(client, event, payload.clone()));
                }
                routes.extend(group_routes(&["managers"], event, payload));
                routes
            }
            ShipmentArriving(notice) => match notice.client_id() {
                Some(client) => {
                    let personal = with_message(
                        payload,
                        "El chofer está llegando a tu dirección",
                        "warning",
                    );
                    vec![user_route(client, event, personal)]
                }
                None => Vec::new(),
            },
            ShipmentDelivered(notice) => {
                let mut routes = Vec::new();
                if let Some(client) = notice.client_id() {
                    let personal =
                        with_message(payload, "Tu pedido fue entregado correctamente", "success");
                    routes.push(user_route(client, event, personal));
                }
                routes.extend(group_routes(
                    &["managers"],
                    "shipment_delivery_completed",
                    payload,
                ));
                routes
            }
            ShipmentDeliveryFailed(notice) => {
                let mut routes = Vec::new();
                if let Some(client) = notice.client_id() {
                    let personal = with_message(
                        payload,
                        "No se pudo entregar el envío. El chofer se contactará contigo.",
                        "error",
                    );
                    routes.push(user_route(client, event, personal));
                }
                routes.extend(group_routes(
                    &["managers"],
                    "shipment_delivery_failed_notification",
                    payload,
                ));
                routes
            }
            VehicleStatusChanged => group_routes(&["managers"], event, payload),
            RouteEvent(notice) => {
                let mut routes = group_routes(&["managers"], event, payload);
                // Deviations and long stops also alert the client.
                let alarming = matches!(
                    notice.tipo_evento.as_deref(),
                    Some("DESVIO") | Some("DETENCCION_LARGA")
                );
                if alarming {
                    if let Some(client) = notice.client_id() {
                        let alert = with_message(payload, "Novedad en la ruta de tu envío", "warning");
                        routes.push(user_route(client, "route_event_alert", alert));
                    }
                }
                routes
            }
        }
    }
}

/// Classify an inbound relay request.
///
/// Total: unmatched names route by hint/payload userId, then userType,
/// then broadcast-all with a warning.
pub fn classify(raw_event: &str, payload: &Value, hint: &RoutingHint) -> Routing {
    if let Some(event) = canonicalize(raw_event, payload) {
        return Routing {
            canonical: event.name().to_string(),
            routes: event.routes(payload),
            matched: true,
        };
    }

    let canonical = normalize_event(raw_event);

    let user_id = hint
        .user_id
        .clone()
        .or_else(|| {
            payload
                .get("user_id")
                .and_then(|v| serde_json::from_value::<RawId>(v.clone()).ok())
                .map(|id| id.normalized())
        })
        .filter(|id| !id.is_empty());

    if let Some(user_id) = user_id {
        return Routing {
            routes: vec![user_route(user_id, &canonical, payload.clone())],
            canonical,
            matched: false,
        };
    }

    if let Some(user_type) = hint.user_type.as_deref().filter(|t| !t.trim().is_empty()) {
        let group = format!("{}s", user_type.trim().to_lowercase());
        return Routing {
            routes: vec![Route {
                event: canonical.clone(),
                target: Target::Group(group),
                payload: payload.clone(),
            }],
            canonical,
            matched: false,
        };
    }

    tracing::warn!(event = %canonical, "Unrecognized event with no routing data, broadcasting to all");
    Routing {
        routes: vec![all_route(&canonical, payload.clone())],
        canonical,
        matched: false,
    }
}
