//! Error taxonomy for the engine entry points.
//!
//! Only [`AnchorError::Validation`] and [`AnchorError::Config`] ever cross an
//! entry point as an `Err`. Store failures during ingestion or retrieval are
//! captured into the per-chunk / per-phase result structures instead.

/// Errors raised by the engine.
#[derive(Debug, thiserror::Error)]
pub enum AnchorError {
    /// Malformed caller input. Rejected before anything is read or written.
    #[error("validation error: {0}")]
    Validation(String),
    /// Invalid configuration, discovered at startup.
    #[error("configuration error: {0}")]
    Config(String),
    /// The backing store could not be reached or dropped the transaction.
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),
    /// Any other store failure.
    #[error("store error: {0}")]
    Store(String),
}

impl AnchorError {
    /// Classify an arbitrary store error, preserving `StoreUnavailable`
    /// when the backend raised it.
    pub fn from_store(err: &anyhow::Error) -> Self {
        match err.downcast_ref::<AnchorError>() {
            Some(AnchorError::StoreUnavailable(msg)) => AnchorError::StoreUnavailable(msg.clone()),
            _ => AnchorError::Store(format!("{:#}", err)),
        }
    }

    /// True for errors that indicate the store is unreachable.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, AnchorError::StoreUnavailable(_))
    }
}
