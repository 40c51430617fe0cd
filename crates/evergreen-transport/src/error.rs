use std::time::Duration;

use evergreen_core::StreamError;

/// Failures of the duplex transport and the wire codec.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("connection error: {0}")]
    Connection(String),
    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),
    #[error("not connected")]
    NotConnected,
    #[error("decode error: {0}")]
    Decode(String),
    #[error("encode error: {0}")]
    Encode(String),
    #[error("send failed: {0}")]
    Send(String),
}

impl TransportError {
    /// Short classification string for logging/metrics.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Connection(_) => "connection",
            Self::ConnectTimeout(_) => "connect_timeout",
            Self::NotConnected => "not_connected",
            Self::Decode(_) => "decode",
            Self::Encode(_) => "encode",
            Self::Send(_) => "send",
        }
    }
}

impl From<TransportError> for StreamError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Decode(msg) => StreamError::Decode(msg),
            other => StreamError::Connection(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for TransportError {
    fn from(e: serde_json::Error) -> Self {
        TransportError::Decode(e.to_string())
    }
}
