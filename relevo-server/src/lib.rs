//! Real-time notification relay.
//!
//! The backend injects domain events over HTTP; authenticated WebSocket
//! clients receive them fanned out by identity (`user_<id>`), role room
//! (`managers`, `cobradores`, ...), or ad-hoc tracking room
//! (`shipment_<id>`). See `SPEC_FULL.md` and `DESIGN.md` at the workspace
//! root.

pub mod auth;
pub mod config;
pub mod connection;
pub mod dispatch;
pub mod registry;
pub mod rooms;
pub mod router;
pub mod server;
pub mod web;
