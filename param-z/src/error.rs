//! Error types for the parameter protocol.

use crate::types::ParamType;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no parameter {ident} on node {node}")]
    NotFound { ident: String, node: u16 },

    #[error("cannot convert {value} to {expected}")]
    TypeMismatch { expected: ParamType, value: String },

    #[error("index {offset} out of range for array of length {len}")]
    IndexOutOfRange { offset: i32, len: u16 },

    #[error("{len} bytes at offset {offset} exceed region size {size}")]
    OutOfBounds { offset: u32, len: usize, size: u32 },

    #[error("expected {expected} values, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },

    #[error("queue full: {needed} bytes needed, {free} free")]
    QueueFull { needed: usize, free: usize },

    #[error("no response from node {node}")]
    NoResponse { node: u16 },

    #[error("protocol version mismatch: expected v{expected}, got v{actual}")]
    ProtocolVersionMismatch { expected: u8, actual: u8 },

    #[error("parameter subsystem is not initialized")]
    Uninitialized,

    #[error("parameter subsystem is already initialized")]
    AlreadyInitialized,

    #[error("parameter {0} is read-only")]
    ReadOnly(String),

    #[error("parameter {0} is not an array")]
    NotArray(String),

    #[error("malformed packet: {0}")]
    Malformed(String),

    #[error("node {node} rejected request (status {status})")]
    Rejected { node: u16, status: u8 },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn malformed(msg: impl Into<String>) -> Self {
        Self::Malformed(msg.into())
    }

    /// True for failures caused by a missing or late answer, which a caller may retry.
    pub fn is_no_response(&self) -> bool {
        matches!(self, Self::NoResponse { .. })
    }
}

impl From<zenoh::Error> for Error {
    fn from(e: zenoh::Error) -> Self {
        Self::Transport(e.to_string())
    }
}

impl From<cdr::Error> for Error {
    fn from(e: cdr::Error) -> Self {
        Self::Malformed(e.to_string())
    }
}
