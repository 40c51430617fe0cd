use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::TransportError;
use crate::wire::SessionMessage;

/// One frame on a duplex message transport.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Bytes),
    Ping(Bytes),
    Pong(Bytes),
}

/// Everything a transport reports to its connection manager.
///
/// A successful start yields `Ready` before any other event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportEvent {
    Ready,
    Frame(Frame),
    Error(String),
    Closed { reason: Option<String> },
}

/// A duplex channel to the remote action host.
///
/// `decode` and `encode` default to JSON text frames; transports with a
/// different framing override them.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Begin connecting. Events, starting with `Ready` on success, arrive on
    /// the returned receiver until the transport closes.
    async fn start(&self) -> Result<mpsc::UnboundedReceiver<TransportEvent>, TransportError>;

    async fn send(&self, frame: Frame) -> Result<(), TransportError>;

    async fn close(&self);

    fn is_open(&self) -> bool;

    /// `Ok(None)` for control frames that carry no protocol message.
    fn decode(&self, frame: &Frame) -> Result<Option<SessionMessage>, TransportError> {
        match frame {
            Frame::Text(text) => Ok(Some(serde_json::from_str(text)?)),
            Frame::Binary(bytes) => Ok(Some(serde_json::from_slice(bytes)?)),
            Frame::Ping(_) | Frame::Pong(_) => Ok(None),
        }
    }

    fn encode(&self, message: &SessionMessage) -> Result<Frame, TransportError> {
        serde_json::to_string(message)
            .map(Frame::Text)
            .map_err(|e| TransportError::Encode(e.to_string()))
    }
}
