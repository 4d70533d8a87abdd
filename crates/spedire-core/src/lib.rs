//! # Spedire Core
//!
//! Configuration and the shared error type used by every Spedire crate.

pub mod config;
pub mod error;

pub use config::{FailMode, SpedireConfig};
pub use error::{Result, SpedireError};
