//! Keywarden error types.
//!
//! Denials are not errors: the validity checker returns them as
//! [`DenyReason`](crate::policy::validity::DenyReason) values and the
//! accountant as [`ChargeError`](crate::meter::accountant::ChargeError).
//! `KeywardenError` covers configuration, administrative input and
//! storage faults.

use thiserror::Error;

/// Errors that can occur while operating the key ledger.
#[derive(Debug, Error)]
pub enum KeywardenError {
    /// Configuration is invalid.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Underlying SQLite failure.
    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// Snapshot or request payload could not be (de)serialized.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Filesystem failure while preparing the database location.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A thread panicked while holding the database lock.
    #[error("Database lock poisoned")]
    LockPoisoned,

    /// Module tag is not one of the known modules.
    #[error("Unknown module: {0}")]
    UnknownModule(String),

    /// Activity action tag is not a known action.
    #[error("Unknown activity action: {0}")]
    UnknownAction(String),

    /// Key status is not `active` or `locked`.
    #[error("Unknown key status: {0}")]
    UnknownStatus(String),

    /// A patch named a field that cannot be edited.
    #[error("Unknown or read-only field: {0}")]
    UnknownField(String),

    /// Administrative key input failed validation.
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    /// `(key, module)` already exists.
    #[error("Key already exists in module")]
    KeyExists,

    /// A counter does not fit the ledger's INTEGER columns.
    #[error("Counter value {0} exceeds the storable range")]
    CounterOverflow(u64),

    /// The edit would leave `usage_count` above `max_usage`.
    #[error("usage_count {usage_count} exceeds max_usage {max_usage}")]
    QuotaBelowUsage {
        /// Resulting usage count.
        usage_count: u64,
        /// Resulting quota.
        max_usage: u64,
    },
}

impl KeywardenError {
    /// Whether this error is a storage-layer fault rather than bad input.
    pub fn is_fault(&self) -> bool {
        matches!(
            self,
            KeywardenError::Storage(_)
                | KeywardenError::Serialization(_)
                | KeywardenError::Io(_)
                | KeywardenError::LockPoisoned
        )
    }
}

impl<T> From<std::sync::PoisonError<T>> for KeywardenError {
    fn from(_: std::sync::PoisonError<T>) -> Self {
        KeywardenError::LockPoisoned
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_errors_are_faults() {
        let err = KeywardenError::from(rusqlite::Error::InvalidQuery);
        assert!(err.is_fault());
        assert!(KeywardenError::LockPoisoned.is_fault());
    }

    #[test]
    fn input_errors_are_not_faults() {
        assert!(!KeywardenError::KeyExists.is_fault());
        assert!(!KeywardenError::UnknownModule("video".into()).is_fault());
        let err = KeywardenError::QuotaBelowUsage {
            usage_count: 4,
            max_usage: 3,
        };
        assert_eq!(err.to_string(), "usage_count 4 exceeds max_usage 3");
        assert!(!KeywardenError::CounterOverflow(u64::MAX).is_fault());
    }
}
