//! Shared types for the NodeBridge crates: configuration and the common
//! error type.

pub mod config;
pub mod error;

pub use error::{Error, Result};
