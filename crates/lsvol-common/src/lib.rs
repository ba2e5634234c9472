//! lsvol Common - Shared types and utilities
//!
//! This crate provides the identifiers, error definitions and engine
//! configuration shared by the storage and volume layers.

pub mod config;
pub mod error;
pub mod types;

pub use config::{EngineConfig, FatalAction};
pub use error::{Error, Result};
pub use types::*;
