use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, BonsaiError>;

/// Error surfaced by the bonsai tree engine and its storage layer.
#[derive(Debug, Error)]
pub enum BonsaiError {
    /// Underlying file or cache I/O failed. Mutating operations roll back
    /// their atomic operation before surfacing this.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// An on-disk invariant was violated while decoding a page or bucket.
    #[error("corruption detected: {0}")]
    Corruption(&'static str),
    /// The caller asked for something the engine does not support in this
    /// state (descending scans, operations on deleted trees, bucket sizes
    /// too small to hold a branch entry).
    #[error("invalid usage: {0}")]
    Usage(&'static str),
    /// A root bucket records a codec id this binary does not know.
    #[error("unsupported serializer id: {0}")]
    UnsupportedSerializer(u8),
}
