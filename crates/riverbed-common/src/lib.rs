//! Riverbed Common - Shared types and utilities
//!
//! This crate provides the error taxonomy, configuration structures and
//! identifier types used across all Riverbed components.

pub mod config;
pub mod error;
pub mod types;

pub use config::Config;
pub use error::{Error, ErrorKind, Result};
pub use types::*;
