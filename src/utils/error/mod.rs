//! Error handling utilities
//!
//! This module defines the error taxonomy shared by every engine component.

mod helpers;
mod types;

// Re-export all public types
pub use types::{OpsError, Result};
