//! Error types for MIME decoding.

use thiserror::Error;

/// Errors from the low-level decode helpers.
///
/// The public parsing surface (`parse_header_block`, `parse_body`) never
/// returns these; it degrades to passthrough instead. They exist for
/// callers of the encoding primitives directly.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed encoded input.
    #[error("Invalid encoding: {0}")]
    InvalidEncoding(String),

    /// Base64 decode failure.
    #[error("Base64 error: {0}")]
    Base64(#[from] base64::DecodeError),
}

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;
