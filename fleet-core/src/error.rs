//! Error types for the fleet core.
//!
//! Library code returns [`FleetError`]; binaries wrap it in `anyhow` at the edge.

use thiserror::Error;

/// Result type alias for fleet operations.
pub type Result<T> = std::result::Result<T, FleetError>;

/// Main error type for the fleet core.
#[derive(Error, Debug)]
pub enum FleetError {
    // VM record errors
    #[error("VM not found: {vm_id}")]
    VmNotFound { vm_id: i64 },

    #[error("Unknown VM state: {value}")]
    InvalidState { value: String },

    #[error("VM {vm_id} has no open history record")]
    NoOpenHistory { vm_id: i64 },

    // Hook errors
    #[error("Invalid hook rule: {reason}. Hook not registered!")]
    InvalidHook { reason: String },

    #[error("Hook {hook} failed: {reason}")]
    HookFailed { hook: String, reason: String },

    // Showback errors
    #[error("Invalid showback window: {reason}")]
    InvalidWindow { reason: String },

    // Database errors
    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Database migration failed: {reason}")]
    MigrationFailed { reason: String },

    // Configuration errors
    #[error("Invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
