//! WebSocket HTTP handler for the web layer.
//!
//! This module only adapts axum sockets to the connection actor. The hub,
//! codec and authorization live in the `realtime` crate.

pub mod handler;
