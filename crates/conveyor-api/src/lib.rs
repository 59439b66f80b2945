//! API server for Conveyor CI.
//!
//! Provides HTTP REST endpoints over the control plane and a WebSocket
//! stream of build events.

pub mod error;
pub mod routes;
pub mod state;
pub mod ws;

pub use state::AppState;
