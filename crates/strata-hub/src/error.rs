//! Error types for strata-hub
//!
//! Module failures are not errors of this crate. A module that returns an
//! error, panics or overruns its deadline is recorded as a
//! [`ModuleFailure`](crate::ModuleFailure) in the tick report and never
//! surfaces as `Err` from [`Scheduler::tick`](crate::Scheduler::tick).

use crate::{LeaseId, ModuleId, ProviderId};
use thiserror::Error;

/// Result type for strata-hub operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in strata-hub
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration text could not be parsed
    #[error("failed to parse scheduler config: {0}")]
    Config(String),

    /// Configuration values are out of range
    #[error("invalid scheduler config: {0}")]
    InvalidConfig(String),

    /// Module settings rejected at registration
    #[error("invalid settings for module '{module}': {reason}")]
    InvalidModuleSettings { module: String, reason: String },

    /// Another module already uses this name
    #[error("module '{0}' is already registered")]
    DuplicateModule(String),

    /// No module with this id
    #[error("module {0} not found")]
    UnknownModule(ModuleId),

    /// A lease was released that its provider never handed out, or released twice
    #[error("lease {lease} is not outstanding on provider {provider}")]
    UnknownLease { lease: LeaseId, provider: ProviderId },

    /// A lease was released on a provider other than the one that issued it
    #[error("lease {lease} was issued by provider {owner} but released on provider {provider}")]
    ForeignLease {
        lease: LeaseId,
        owner: ProviderId,
        provider: ProviderId,
    },

    /// The snapshot pool has no free snapshot and is at capacity
    #[error("snapshot pool exhausted ({capacity} snapshots in use)")]
    PoolExhausted { capacity: usize },

    /// Core error
    #[error("core error: {0}")]
    Core(#[from] strata_core::Error),
}

impl Error {
    /// Whether this error marks a misuse of the acquire/release protocol
    pub fn is_lease_violation(&self) -> bool {
        matches!(self, Error::UnknownLease { .. } | Error::ForeignLease { .. })
    }
}

// Compile-time check that Error is Send + Sync for thread-safe error propagation.
fn _assert_error_send_sync<T: Send + Sync>() {}
fn _error_is_send_sync() {
    _assert_error_send_sync::<Error>();
}
