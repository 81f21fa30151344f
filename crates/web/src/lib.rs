//! Browsercast web surface
//!
//! Thin HTTP/WebSocket translation layer over the session core:
//! session CRUD, action execution, content introspection, and the
//! live frame stream.

pub mod server;
pub mod ws;

pub use server::{serve, AppState};
