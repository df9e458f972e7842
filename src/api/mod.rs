//! Control API
//!
//! REST endpoints for group state and manual selection, connection records,
//! and WebSocket streams for record updates and captured traffic.

pub mod handlers;
pub mod middleware;
pub mod routes;
pub mod server;
pub mod websocket;

pub use server::ApiServer;
