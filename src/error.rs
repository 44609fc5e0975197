// =============================================================================
// Error taxonomy for the ingestion core
// =============================================================================
//
// None of these abort the process. Each one is logged, recorded in the
// diagnostics ring, and the series degrades to empty or stays unchanged.
// =============================================================================

use thiserror::Error;

#[derive(Debug, Error)]
pub enum IngestError {
    /// Inbound payload with missing fields or non-numeric prices. The
    /// message is dropped and the connection stays open.
    #[error("malformed kline message: {0}")]
    MalformedMessage(String),

    /// A stored record failed shape validation and was reset to empty.
    #[error("corrupt stored series for {key}: {reason}")]
    CorruptPersistence { key: String, reason: String },

    /// Connect failure or disconnect of the upstream channel.
    #[error("transport failure: {0}")]
    TransportFailure(String),

    /// Selection input that does not normalize to a valid key.
    #[error("invalid selection: {0}")]
    InvalidSelection(String),

    /// Writing a series to durable storage failed.
    #[error("storage error: {0}")]
    Storage(String),
}

impl IngestError {
    /// Short machine-readable kind, used by the diagnostics log.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::MalformedMessage(_) => "malformed_message",
            Self::CorruptPersistence { .. } => "corrupt_persistence",
            Self::TransportFailure(_) => "transport_failure",
            Self::InvalidSelection(_) => "invalid_selection",
            Self::Storage(_) => "storage",
        }
    }
}
