use thiserror::Error;

/// Result alias used throughout the daemon; defaults to [`DaemonError`].
pub type Result<T, E = DaemonError> = core::result::Result<T, E>;

/// Shared error taxonomy for the session daemon.
///
/// Every fallible component (Store, Adapter, Session Engine, User Admin)
/// propagates one of these with `?`; only the HTTP boundary translates a
/// variant into a status code and JSON envelope.
#[derive(Debug, Error)]
pub enum DaemonError {
    /// Caller-supplied input failed a shape or format check.
    #[error("{0}")]
    Validation(String),
    /// The requested mutation conflicts with existing state (duplicate key, exhausted pool).
    #[error("{0}")]
    Conflict(String),
    /// No row exists for the requested id.
    #[error("{0}")]
    NotFound(String),
    /// The peer-table adapter failed to apply a mutation to the live interface.
    #[error("adapter error: {0}")]
    Adapter(String),
    /// The persistent store failed a query or transaction.
    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),
    /// Anything else; surfaced as an opaque 500.
    #[error("{0}")]
    Internal(String),
}

impl DaemonError {
    /// Build a [`DaemonError::Validation`] from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Build a [`DaemonError::Conflict`] from any displayable message.
    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    /// Build a [`DaemonError::NotFound`] from any displayable message.
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Build a [`DaemonError::Adapter`] from any displayable message.
    pub fn adapter(msg: impl Into<String>) -> Self {
        Self::Adapter(msg.into())
    }

    /// Build a [`DaemonError::Internal`] from any displayable message.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}
