use thiserror::Error;

/// Failures the ingestion pipeline distinguishes between.
///
/// Everything except [`IngestError::AggregationInput`] and
/// [`IngestError::Config`] is contained where it happens: the tick is dropped,
/// the feed reconnects, or the next publish retries.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum IngestError {
    #[error("invalid tick at epoch {epoch}: {reason}")]
    InvalidTick { epoch: i64, reason: String },

    #[error("feed disconnected: {0}")]
    FeedDisconnect(String),

    #[error("store write to {collection} failed: {message}")]
    StoreWrite { collection: String, message: String },

    #[error("store read from {collection} failed: {message}")]
    StoreRead { collection: String, message: String },

    #[error("aggregation input violates window invariants: {0}")]
    AggregationInput(String),

    #[error("config error: {0}")]
    Config(String),
}

impl IngestError {
    pub fn invalid_tick(epoch: i64, reason: impl Into<String>) -> Self {
        Self::InvalidTick {
            epoch,
            reason: reason.into(),
        }
    }

    /// Whether the ingestion loop may carry on after this error.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::AggregationInput(_) | Self::Config(_))
    }
}
