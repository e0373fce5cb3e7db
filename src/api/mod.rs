//! HTTP and WebSocket surface
//!
//! Health, status and metrics endpoints plus the client session socket.

pub mod errors;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod routes;
pub mod server;
pub mod websocket;

pub use server::{shutdown_signal, ApiServer};
pub use websocket::{RequestFrame, SessionManager};
