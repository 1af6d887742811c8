/// Errors surfaced by every [`crate::StateMachine`] operation.
///
/// Nothing is retried or swallowed inside the store; callers own retry policy.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The message was rejected before any mutation.
    #[error("bad metadata: {0}")]
    Validation(String),

    #[cfg(feature = "sqlite")]
    #[error("storage error: {0}")]
    Storage(#[source] rusqlite::Error),

    /// A persisted or serialized value could not be turned back into its type.
    #[error("cannot decode {field}: {reason}")]
    Decode { field: &'static str, reason: String },

    #[error("attempting to initialize non-ephemeral state machine")]
    NonEphemeralInit,

    /// An in-flight statement was interrupted by the caller.
    #[error("operation cancelled")]
    Cancelled,

    #[error("store lock poisoned")]
    LockPoisoned,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;

impl StoreError {
    pub(crate) fn decode(field: &'static str, reason: impl Into<String>) -> Self {
        StoreError::Decode {
            field,
            reason: reason.into(),
        }
    }
}

#[cfg(feature = "sqlite")]
impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        if err.sqlite_error_code() == Some(rusqlite::ErrorCode::OperationInterrupted) {
            return StoreError::Cancelled;
        }
        StoreError::Storage(err)
    }
}

#[cfg(all(test, feature = "sqlite"))]
mod tests {
    use super::*;

    #[test]
    fn interrupted_statements_map_to_cancelled() {
        let interrupted = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_INTERRUPT),
            None,
        );
        assert!(matches!(StoreError::from(interrupted), StoreError::Cancelled));

        let busy = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        );
        assert!(matches!(StoreError::from(busy), StoreError::Storage(_)));
    }
}
