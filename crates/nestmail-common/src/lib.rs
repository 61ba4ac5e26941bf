//! Nestmail Common - Shared types and utilities
//!
//! This crate provides common types, configuration, and error handling
//! shared across all nestmail components.

pub mod config;
pub mod error;
pub mod types;

pub use config::Config;
pub use error::{Error, Result};
