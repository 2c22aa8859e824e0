//! shardr error types

/// shardr result type
pub type Result<T> = std::result::Result<T, Error>;

/// shardr errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Error from numr operations
    #[error("numr error: {0}")]
    Numr(#[from] numr::error::Error),

    /// Invalid configuration, detected at construction time
    #[error("config error: {reason}")]
    Config {
        /// Description of what went wrong
        reason: String,
    },

    /// Bookkeeping invariant violation (e.g. duplicate gradient reduction)
    ///
    /// Never recovered: it indicates the bucket/store accounting is corrupted
    /// and continuing would silently corrupt gradients.
    #[error("accounting error: {reason}")]
    Accounting {
        /// Description of what went wrong
        reason: String,
    },

    /// Distributed communication error
    #[error("distributed error: {reason}")]
    Distributed {
        /// Description of what went wrong
        reason: String,
    },

    /// Pipeline schedule / microbatch contract violation
    #[error("pipeline error: {reason}")]
    Pipeline {
        /// Description of what went wrong
        reason: String,
    },
}
