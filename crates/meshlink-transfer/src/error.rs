use meshlink_shared::types::TransferId;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransferError {
    /// Rejected chunker settings. Raised before any I/O happens.
    #[error("Invalid chunker config: {0}")]
    InvalidConfig(String),

    #[error("Unknown transfer {0}")]
    UnknownTransfer(TransferId),

    /// A chunk or message broke a size or index invariant.
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Send failed: {0}")]
    Send(String),
}

impl From<bincode::Error> for TransferError {
    fn from(e: bincode::Error) -> Self {
        TransferError::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for TransferError {
    fn from(e: serde_json::Error) -> Self {
        TransferError::Serialization(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, TransferError>;
