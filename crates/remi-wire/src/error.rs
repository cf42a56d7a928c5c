//! Error types for wire encoding and decoding

use thiserror::Error;

/// Wire-level error types
#[derive(Debug, Error)]
pub enum WireError {
    /// End of stream reached before the current value was fully read.
    #[error("unexpected end of stream")]
    Eof,

    /// An illegal tag or byte sequence was encountered.
    #[error("corrupted stream: {0}")]
    Corrupted(String),

    /// A value could not be marshalled by the object codec.
    #[error("not serializable: {0}")]
    NotSerializable(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, WireError>;
