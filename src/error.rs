//! Error types for shard-map management.

use thiserror::Error;

/// Result type alias for shard-map management operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Broad classification of a shard-management failure, used for
/// diagnostics and error routing by callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Shard-map level failures (create/delete/lookup of shard maps).
    ShardMap,
    /// Shard level failures (add/remove/update of shards).
    Shard,
    /// Mapping level failures (create/split/merge/lock of mappings).
    Mapping,
    /// Failures raised while reconciling global and local stores.
    Recovery,
    /// Validation of caller-supplied arguments.
    Validation,
    /// Everything else (store protocol, version, aborted operations).
    General,
}

/// Specific failure code carried by [`Error::ShardManagement`].
///
/// These map one-to-one onto the store-reported conflict codes; they are
/// terminal and never retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardManagementErrorCode {
    /// A shard map with the same name already exists.
    ShardMapAlreadyExists,
    /// The referenced shard map does not exist.
    ShardMapDoesNotExist,
    /// The shard map still contains shards and cannot be removed.
    ShardMapHasShards,
    /// A shard already exists at the given location.
    ShardAlreadyExists,
    /// The referenced shard does not exist.
    ShardDoesNotExist,
    /// The shard still has mappings and cannot be removed.
    ShardHasMappings,
    /// The shard was modified concurrently (version CAS failed).
    ShardVersionMismatch,
    /// The referenced mapping does not exist.
    MappingDoesNotExist,
    /// The requested range intersects an existing mapping.
    MappingRangeAlreadyMapped,
    /// No mapping covers the given key.
    MappingNotFoundForKey,
    /// The mapping must be offline for this operation.
    MappingIsNotOffline,
    /// The mapping is offline and cannot serve routing requests.
    MappingIsOffline,
    /// The mapping is already locked by another owner.
    MappingIsAlreadyLocked,
    /// The supplied lock token does not match the mapping's owner.
    MappingLockOwnerIdDoesNotMatch,
    /// The store schema/protocol version is not supported.
    StoreVersionMismatch,
    /// The in-flight operation log entry disappeared; a concurrent
    /// caller assumed this process was dead and undid the operation.
    OperationAborted,
    /// Transient faults persisted beyond the retry budget.
    RetriesExhausted,
    /// The store reported a code the client does not understand.
    UnexpectedStoreError,
}

/// Main error type for shard-map management.
#[derive(Error, Debug)]
pub enum Error {
    /// A store-reported domain conflict, translated from a result code.
    #[error("shard management error ({category:?}/{code:?}) in '{operation}': {message}")]
    ShardManagement {
        /// Failure classification.
        category: ErrorCategory,
        /// Specific failure code.
        code: ShardManagementErrorCode,
        /// The high-level operation that failed.
        operation: String,
        /// Human-readable detail.
        message: String,
    },

    /// Caller-supplied arguments failed local validation. Raised before
    /// any store call is made.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A transient infrastructure fault (connection drop, deadlock,
    /// timeout). Absorbed by the retry policy; only surfaces wrapped as
    /// [`ShardManagementErrorCode::RetriesExhausted`].
    #[error("transient store fault: {0}")]
    Transient(String),

    /// A non-transient infrastructure fault from the store transport.
    #[error("store fault: {0}")]
    Store(String),

    /// Internal invariant violation.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether the retry policy may re-attempt the failed unit of work.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Transient(_))
    }

    /// Shorthand constructor for store-reported conflicts.
    pub(crate) fn shard_management(
        category: ErrorCategory,
        code: ShardManagementErrorCode,
        operation: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Error::ShardManagement {
            category,
            code,
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// The specific management error code, when this is a translated
    /// store conflict.
    pub fn management_code(&self) -> Option<ShardManagementErrorCode> {
        match self {
            Error::ShardManagement { code, .. } => Some(*code),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(Error::Transient("deadlock".into()).is_transient());
        assert!(!Error::Store("disk gone".into()).is_transient());
        assert!(!Error::InvalidArgument("bad key".into()).is_transient());
    }

    #[test]
    fn management_code_accessor() {
        let err = Error::shard_management(
            ErrorCategory::Mapping,
            ShardManagementErrorCode::MappingIsNotOffline,
            "delete_mapping",
            "mapping is online",
        );
        assert_eq!(
            err.management_code(),
            Some(ShardManagementErrorCode::MappingIsNotOffline)
        );
        assert_eq!(Error::Internal("x".into()).management_code(), None);
    }
}
