//! Storage errors. Each names the key or prefix involved; values never
//! appear.

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("cannot open storage at {path}: {reason}")]
    Open { path: String, reason: String },

    #[error("read of '{key}' failed: {reason}")]
    Read { key: String, reason: String },

    #[error("write of '{key}' failed: {reason}")]
    Write { key: String, reason: String },

    #[error("delete of '{key}' failed: {reason}")]
    Delete { key: String, reason: String },

    #[error("listing prefix '{prefix}' failed: {reason}")]
    List { prefix: String, reason: String },

    /// The backing table or column family is gone.
    #[error("table '{name}' does not exist")]
    MissingTable { name: String },

    #[error("storage transaction failed: {reason}")]
    Transaction { reason: String },

    /// A stored key is not valid UTF-8.
    #[error("stored key is not valid UTF-8: {reason}")]
    InvalidKey { reason: String },
}
