//! Typed errors for the wire layer, identifiers and configuration.
//!
//! Lookup procedures never surface these to their callers: a failed RPC only
//! means "no new information". They exist so the transport and the binary can
//! report precise causes.

use thiserror::Error;

/// Failures while exchanging frames with a peer.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// A frame announced (or would need) more bytes than we accept.
    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge { len: usize, max: usize },

    /// The peer answered with an error response.
    #[error("peer rejected request: {message}")]
    Remote { message: String },

    /// The peer answered with a response that does not match the request.
    #[error("unexpected `{got}` response to `{expected}` request")]
    UnexpectedResponse {
        expected: &'static str,
        got: &'static str,
    },

    /// The connection closed before a reply frame arrived.
    #[error("connection closed before a reply was received")]
    ConnectionClosed,
}

/// Failures while parsing a textual node identifier.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ParseIdError {
    #[error("node id must be {expected} hex characters, got {got}")]
    Length { expected: usize, got: usize },

    #[error("node id is not valid hex: {0}")]
    Hex(#[from] hex::FromHexError),
}

/// Invalid configuration values.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("`{field}` must be greater than zero")]
    Zero { field: &'static str },

    #[error("`id_bits` must be within 1..=160, got {0}")]
    IdBits(usize),
}

/// A shell line that does not form a command.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ShellParseError {
    #[error("empty command")]
    Empty,

    #[error("unknown command `{0}`, try `help`")]
    Unknown(String),

    #[error("usage: {0}")]
    Usage(&'static str),

    #[error("invalid address `{0}`, expected ip:port")]
    Address(String),
}
