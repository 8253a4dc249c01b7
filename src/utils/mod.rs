//! Utility modules
//!
//! - **error**: Error types and constructors
//! - **logging**: Subscriber setup for `tracing`

pub mod error; // Error handling
pub mod logging; // Logging setup

pub use logging::{LogFormat, init_logging};
