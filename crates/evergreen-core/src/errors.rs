/// Errors surfaced by streams and pipes.
///
/// Cloneable so that one reason can be delivered to every cursor of an
/// errored stream.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum StreamError {
    // Local programmer errors
    #[error("stream is closed")]
    Closed,
    #[error("out of order write to {id}: expected seq {expected}, got {actual}")]
    OutOfOrder { id: String, expected: u64, actual: u64 },

    // Inbound payload problems
    #[error("decode error: {0}")]
    Decode(String),

    // Transport and peer failures
    #[error("connection error: {0}")]
    Connection(String),
    #[error("remote error: {0}")]
    Remote(String),
}

impl StreamError {
    /// Fatal errors end the affected pipe; nothing in the core retries them.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Closed | Self::OutOfOrder { .. } | Self::Decode(_))
    }

    /// Short classification string for logging/metrics.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::OutOfOrder { .. } => "out_of_order",
            Self::Decode(_) => "decode",
            Self::Connection(_) => "connection",
            Self::Remote(_) => "remote",
        }
    }
}
