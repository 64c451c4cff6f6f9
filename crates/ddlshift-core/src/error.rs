//! Errors from the embedded store and the snapshot wire format.

use thiserror::Error;

/// Failure reading or writing persisted engine state.
#[derive(Debug, Error)]
pub enum Error {
    /// The sled tree rejected the operation.
    #[error("storage error: {0}")]
    Storage(#[from] sled::Error),

    /// A snapshot could not be encoded with rkyv.
    #[error("snapshot encode failed: {0}")]
    Encode(String),

    /// Stored snapshot bytes did not decode.
    #[error("snapshot decode failed: {0}")]
    Decode(String),
}
