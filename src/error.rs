//! Error types shared across the service.

use thiserror::Error;

/// Errors produced by the stores, the bus consumer and the policy engine.
#[derive(Debug, Error)]
pub enum Error {
    /// Database failure.
    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    /// Message-bus failure.
    #[error("bus error: {0}")]
    Bus(#[from] lapin::Error),

    /// A ban profile referenced a grouping column outside the allowlist.
    #[error("invalid group column `{0}`")]
    Policy(String),

    /// Malformed client input.
    #[error("{0}")]
    Validation(String),

    /// The requested entry does not exist.
    #[error("not found")]
    NotFound,
}
