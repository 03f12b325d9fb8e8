//! Error types for postage-gateway.

use thiserror::Error;

/// Result type alias using the crate's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in postage-gateway.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid configuration. Fatal at startup.
    #[error("configuration error: {0}")]
    Config(String),

    /// The node's postage API failed or returned something unparseable.
    #[error("postage repository error: {0}")]
    Repository(String),

    /// A purchased stamp never became usable within the polling budget.
    #[error("stamp {id} did not become usable after {attempts} polls")]
    PurchaseTimeout {
        /// Id of the stamp that was created.
        id: String,
        /// Number of polls performed.
        attempts: u32,
    },

    /// No usable stamp is currently known.
    #[error("No postage stamp")]
    NoStampAvailable,

    /// A request body exceeded the configured limit.
    #[error("Request body exceeds {limit} bytes")]
    PayloadTooLarge {
        /// Configured limit in bytes.
        limit: usize,
    },

    /// Forwarding a request to the node failed.
    #[error("gateway error: {0}")]
    Gateway(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Returns true for failures that are expected to clear up on a later refresh.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Repository(_) | Self::PurchaseTimeout { .. } | Self::NoStampAvailable
        )
    }
}
