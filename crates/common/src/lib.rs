//! Browsercast Common Library
//!
//! Shared types and error taxonomy for the browsercast platform.

pub mod error;
pub mod types;

// Re-export commonly used types
pub use error::{Error, Result};
pub use types::*;

/// Browsercast version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
