//! Shared utilities, configuration, and error handling for Docmaker
//!
//! This crate provides common functionality used across the Docmaker workspace:
//! - Configuration management following 12-factor principles
//! - Error types and their HTTP mapping
//! - State machine error types
//! - Request extractors

pub mod config;
pub mod error;
pub mod extractors;
pub mod state;

pub use config::{BackoffKind, Config};
pub use error::{Error, Result};
pub use extractors::{Pagination, ValidatedJson};
pub use state::StateError;
