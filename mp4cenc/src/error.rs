//! Error types for mp4 parsing and decryption.

use thiserror::Error;

/// Errors that can occur while parsing or decrypting an mp4 stream.
#[derive(Debug, Error)]
pub enum Error {
    /// Structurally invalid or truncated container data.
    #[error("malformed container: {0}")]
    Malformed(String),

    /// Protection scheme not supported for decryption.
    #[error("unsupported protection scheme: {0} (supported: cenc, cens, cbc1, cbcs)")]
    UnsupportedScheme(String),

    /// A track is marked as protected but the metadata needed to decrypt
    /// it is absent.
    #[error("missing protection metadata: {0}")]
    MissingProtection(String),

    /// Invalid hex string in a KID or key.
    #[error("invalid hex string: {0}")]
    InvalidHex(#[from] hex::FromHexError),

    /// KID or key with the wrong byte length.
    #[error("invalid key format: expected {expected} bytes, got {actual} bytes")]
    KeyWrongLength { expected: usize, actual: usize },

    /// Invalid IV size.
    #[error("invalid IV size: {0} bytes")]
    InvalidIvSize(usize),

    /// No decryption keys provided.
    #[error("no decryption keys provided - use .key(kid, key) to add keys")]
    NoKeys,

    /// Key not found for the given KID.
    #[error("key not found for KID: {0} - ensure the correct KID/key pair is provided")]
    KeyNotFound(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for mp4 parsing and decryption operations.
pub type Result<T> = std::result::Result<T, Error>;
