//! # Spedire Gateway
//!
//! Axum HTTP surface for the automation dispatcher.
//!
//! - `GET|POST /api/cron/automation-dispatcher`: tick endpoint for an external
//!   scheduler, `Authorization: Bearer <cron_secret>`.
//! - `/api/v1/automations/...`: admin API, `X-Admin-Token` when configured.
//! - `GET /health`: liveness.

pub mod routes;
pub mod server;

pub use server::{AppState, build_router, start};
