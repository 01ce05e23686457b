use std::sync::Arc;

use thiserror::Error;

use crate::message::{CompressionType, MessageType, SeqNumber};
use crate::protocol::MethodType;

/// Errors produced by the RPC runtime.
///
/// The type is `Clone` so a single failure (for example a fatal reconnect
/// error) can be handed to every waiter.
#[derive(Debug, Clone, Error)]
pub enum RpcError {
    #[error("framing error: {reason}")]
    Framing { reason: String },

    #[error("frame too large: {len} bytes (max {max})")]
    FrameTooLarge { len: usize, max: usize },

    #[error("invalid message type: {0}")]
    InvalidMessageType(i64),

    #[error("wrong message length for {kind}: got {len} fields, need at least {min}")]
    ShortMessage {
        kind: MessageType,
        len: usize,
        min: usize,
    },

    #[error("error decoding field {index}: {reason}")]
    FieldDecode { index: usize, reason: String },

    #[error(
        "error decoding {kind} message (method {}, length {len}, compression {compression}): {source}",
        .method.as_deref().unwrap_or("unknown")
    )]
    MessageDecode {
        kind: MessageType,
        seq: Option<SeqNumber>,
        method: Option<String>,
        len: usize,
        compression: CompressionType,
        source: Box<RpcError>,
    },

    #[error("protocol not found: {0}")]
    ProtocolNotFound(String),

    #[error("method '{method}' not found in protocol '{protocol}'")]
    MethodNotFound { protocol: String, method: String },

    #[error("method '{method}' is registered as {registered}, received as {received}")]
    WrongMethodType {
        method: String,
        registered: MethodType,
        received: MethodType,
    },

    #[error("protocol already registered: {0}")]
    AlreadyRegistered(String),

    #[error("call not found for sequence number {0}")]
    CallNotFound(SeqNumber),

    #[error("RPC argument type mismatch: expected {expected}")]
    TypeMismatch { expected: &'static str },

    #[error("encode error: {0}")]
    Encode(String),

    #[error("{compression} compression error: {reason}")]
    Compression {
        compression: CompressionType,
        reason: String,
    },

    #[error("context canceled")]
    Canceled,

    #[error("context deadline exceeded")]
    DeadlineExceeded,

    #[error("EOF")]
    Eof,

    #[error("connection has been shut down")]
    Shutdown,

    #[error("not connected")]
    NotConnected,

    #[error("invalid address {addr:?}: {reason}")]
    InvalidAddress { addr: String, reason: String },

    #[error("TLS error: {reason}")]
    Tls { reason: String },

    /// Error value returned by the remote handler, as unwrapped by the
    /// default [`StringErrorUnwrapper`](crate::client::StringErrorUnwrapper).
    #[error("{0}")]
    Remote(String),

    #[error(transparent)]
    Application(Arc<dyn std::error::Error + Send + Sync>),

    #[error(transparent)]
    Io(Arc<std::io::Error>),
}

impl RpcError {
    /// Wraps an application-defined error.
    pub fn application<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        RpcError::Application(Arc::new(err))
    }

    /// A remote error carrying only a message.
    pub fn remote(msg: impl Into<String>) -> Self {
        RpcError::Remote(msg.into())
    }

    pub(crate) fn framing(reason: impl Into<String>) -> Self {
        RpcError::Framing {
            reason: reason.into(),
        }
    }

    /// True when the error means the underlying stream ended or died.
    pub fn is_eof(&self) -> bool {
        match self {
            RpcError::Eof => true,
            RpcError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
            ),
            _ => false,
        }
    }

    /// True for context cancellation or deadline expiry.
    pub fn is_canceled(&self) -> bool {
        matches!(self, RpcError::Canceled | RpcError::DeadlineExceeded)
    }

    /// True for errors local to a single message. The receive loop keeps
    /// reading after one of these.
    pub fn is_benign(&self) -> bool {
        match self {
            RpcError::ProtocolNotFound(_)
            | RpcError::MethodNotFound { .. }
            | RpcError::WrongMethodType { .. }
            | RpcError::CallNotFound(_)
            | RpcError::FieldDecode { .. }
            | RpcError::TypeMismatch { .. }
            | RpcError::Compression { .. } => true,
            RpcError::MessageDecode { source, .. } => source.is_benign(),
            _ => false,
        }
    }

    /// True when the byte stream itself can no longer be trusted.
    pub fn is_fatal_framing(&self) -> bool {
        match self {
            RpcError::Framing { .. }
            | RpcError::FrameTooLarge { .. }
            | RpcError::InvalidMessageType(_)
            | RpcError::ShortMessage { .. } => true,
            RpcError::MessageDecode { source, .. } => source.is_fatal_framing(),
            _ => false,
        }
    }
}

impl From<std::io::Error> for RpcError {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            return RpcError::Eof;
        }
        RpcError::Io(Arc::new(err))
    }
}

pub type Result<T> = std::result::Result<T, RpcError>;
