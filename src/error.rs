use thiserror::Error;

/// Failure to decode a scene buffer or a relay message.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Truncated input: needed {needed} bytes, {available} available")]
    Truncated { needed: usize, available: usize },

    #[error("Unknown node kind tag: {0}")]
    UnknownNodeKind(i32),

    #[error("Unknown {field} value: {value}")]
    UnknownEnum { field: &'static str, value: i32 },

    #[error("Unknown message kind: {0}")]
    UnknownMessageKind(u8),

    #[error("Payload size mismatch for {parameter_type}: expected {expected}, got {actual}")]
    PayloadSize {
        parameter_type: String,
        expected: usize,
        actual: usize,
    },

    #[error("Invalid UTF-8 in string field")]
    InvalidUtf8,

    #[error("Negative element count: {0}")]
    NegativeCount(i32),

    #[error("{0} trailing bytes after last record")]
    TrailingBytes(usize),
}

impl DecodeError {
    pub fn is_truncated(&self) -> bool {
        matches!(self, DecodeError::Truncated { .. })
    }
}

#[derive(Error, Debug)]
pub enum LinkError {
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Invalid message format: {0}")]
    InvalidMessage(String),

    #[error("Invalid scene: {0}")]
    InvalidScene(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("MessagePack encode error: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),

    #[error("MessagePack decode error: {0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),

    #[error("Bincode error: {0}")]
    Bincode(#[from] bincode::Error),

    #[error("Connection closed")]
    ConnectionClosed,
}

pub type Result<T> = std::result::Result<T, LinkError>;
