//! Core functionality for the engine
//!
//! This module contains the core business logic and data structures.

pub mod operations;
