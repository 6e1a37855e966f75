//! Error types for pcom-link.

use thiserror::Error;

/// Main error type for all link operations.
#[derive(Debug, Error)]
pub enum PcomError {
    /// I/O error on the transport.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error while loading or saving a registry.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Malformed format specifier (dangling repeat count, misplaced `*`, ...).
    #[error("Invalid format string: {0}")]
    InvalidFormat(String),

    /// Values could not be packed according to a format string.
    #[error("Encoding error: {0}")]
    Encoding(String),

    /// Bytes could not be unpacked according to a format string.
    #[error("Decoding error: {0}")]
    Decoding(String),

    /// Textual input could not be coerced to the requested type.
    #[error("Cannot cast {token:?}: {reason}")]
    Cast {
        /// The offending input token.
        token: String,
        /// Why the cast failed.
        reason: String,
    },

    /// No registered command/property/stream for this destination.
    #[error("Unknown target {name} on {destination}")]
    UnknownTarget {
        /// Destination service as given by the caller.
        destination: String,
        /// Command, property or stream name (or id).
        name: String,
    },

    /// Parameters do not fit the registered format.
    #[error("Type mismatch: {0}")]
    TypeMismatch(String),

    /// De-escaped packet bytes do not sum to zero.
    #[error("Checksum mismatch: packet sums to {sum:#04x}")]
    Checksum {
        /// Residual sum of the de-escaped packet (0 when valid).
        sum: u8,
    },

    /// Missing START/STOP delimiters, bad escape, or inconsistent length.
    #[error("Framing error: {0}")]
    Framing(String),

    /// No ACK after the whole retry budget was spent.
    #[error("Delivery of sequence {sequence} timed out after {attempts} attempts")]
    DeliveryTimeout {
        /// Sequence number of the failed packet.
        sequence: u8,
        /// Total transmissions, first send included.
        attempts: u16,
    },

    /// Peer answered with a NAK.
    #[error("Delivery of sequence {sequence} rejected by peer (status {status})")]
    DeliveryRejected {
        /// Sequence number of the rejected packet.
        sequence: u8,
        /// Status code carried in the NAK.
        status: u8,
    },

    /// Link closed while the delivery was pending, or send after close.
    #[error("Link closed")]
    LinkClosed,

    /// Every dynamic service id has been handed out.
    #[error("Dynamic id space exhausted while registering {0:?}")]
    IdSpaceExhausted(String),
}

/// Result type alias using PcomError.
pub type Result<T> = std::result::Result<T, PcomError>;
