//! `Strongroom` HTTP server.
//!
//! Wires the core library and a storage backend into an Axum JSON API under
//! `/v1/*`, and runs the lease sweeper beside it.

pub mod config;
pub mod error;
pub mod hardening;
pub mod middleware;
pub mod routes;
pub mod state;
