//! # gatekeep_core
//!
//! Identity session management: purpose-scoped tokens, refresh sessions,
//! email-verification flows, rate limiting and atomic account mutations.

pub mod config;
pub mod context;
pub mod error;
pub mod ledger;
pub mod migrate;
pub mod models;
pub mod otp;
pub mod password;
pub mod rate_limit;
pub mod service;
pub mod store;
pub mod token;

pub use error::{AuthError, Result};

/// Returns the crate version.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_is_not_empty() {
        assert!(!version().is_empty());
    }
}
