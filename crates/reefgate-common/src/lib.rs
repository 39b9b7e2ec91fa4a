//! Reefgate common types
//!
//! Shared between the authentication pipeline and any embedding binary:
//! the S3 API error taxonomy and gateway configuration.

pub mod config;
pub mod error;

pub use config::AuthConfig;
pub use error::{ApiError, Result};
