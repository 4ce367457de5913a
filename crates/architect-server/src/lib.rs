//! The Architect build coordinator process.
//!
//! Accepts builder links, runs the scheduler and serves health checks, a
//! builder listing and a WebSocket feed of live changes.

pub mod error;
pub mod listener;
pub mod routes;
pub mod state;
pub mod ws;

pub use state::AppState;
