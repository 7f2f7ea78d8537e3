//! Huginn error types

/// Huginn error types
///
/// Only construction-time and binding-layer faults surface as errors.
/// Application-level request failures are never errors: they are retried
/// and finally stored as [`QueryResult::Error`](crate::QueryResult::Error).
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    // Key derivation errors
    /// Arguments could not be hashed by the default hash function.
    #[error("non-serializable argument: {0}")]
    NonSerializableArgument(String),

    // Registry errors
    /// No live entry for the key. Call `get_or_create` first.
    #[error("no cache entry with key {0}")]
    NoSuchEntry(String),

    /// A live entry already exists for the key. Evict it first.
    #[error("a cache entry with key {0} already exists")]
    DuplicateEntry(String),

    /// Installing the dependencies of `key` would close a cycle through `upstream`.
    #[error("cyclic dependency: {key} depends on {upstream}, which already depends on {key}")]
    CyclicDependency { key: String, upstream: String },

    /// A mutation entry was looked up with a different argument type than it
    /// was created with.
    #[error("mutation {0} was created with a different argument type")]
    TypeMismatch(String),

    // Transport errors
    /// The transport itself failed (network exception, unparseable response).
    ///
    /// Not retried. The fetch cycle is abandoned and the entry stays `Loading`.
    #[error("transport fault: {0}")]
    Transport(String),

    // Data errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // Configuration errors
    #[error("configuration error: {0}")]
    Config(String),
}

impl CacheError {
    /// Whether this error is a transport fault rather than a binding-layer bug.
    pub fn is_transport(&self) -> bool {
        matches!(self, CacheError::Transport(_))
    }

    /// Whether this error was raised because of an unknown key.
    pub fn is_missing_entry(&self) -> bool {
        matches!(self, CacheError::NoSuchEntry(_))
    }
}

/// Result type alias for Huginn operations
pub type Result<T> = std::result::Result<T, CacheError>;
