//! WebSocket transport over `tokio-tungstenite`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use crate::cache::TransportFactory;
use crate::error::TransportError;
use crate::transport::{Frame, Transport, TransportEvent};

pub struct WebSocketTransport {
    url: String,
    outbound: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    open: Arc<AtomicBool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl WebSocketTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            outbound: Mutex::new(None),
            open: Arc::new(AtomicBool::new(false)),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    fn name(&self) -> &str {
        "websocket"
    }

    async fn start(&self) -> Result<mpsc::UnboundedReceiver<TransportEvent>, TransportError> {
        let (ws, _) = connect_async(self.url.as_str())
            .await
            .map_err(|e| TransportError::Connection(format!("WebSocket connect: {e}")))?;
        let (mut ws_tx, mut ws_rx) = ws.split();

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
        self.open.store(true, Ordering::SeqCst);
        *self.outbound.lock() = Some(outbound_tx);
        let _ = events_tx.send(TransportEvent::Ready);

        // Writer task: forward outbound messages to the socket
        let writer_open = Arc::clone(&self.open);
        let writer_events = events_tx.clone();
        let writer = tokio::spawn(async move {
            while let Some(msg) = outbound_rx.recv().await {
                let closing = matches!(msg, Message::Close(_));
                if let Err(e) = ws_tx.send(msg).await {
                    writer_open.store(false, Ordering::SeqCst);
                    let _ = writer_events.send(TransportEvent::Error(e.to_string()));
                    break;
                }
                if closing {
                    break;
                }
            }
        });

        // Reader task: translate socket messages into transport events
        let reader_open = Arc::clone(&self.open);
        let reader = tokio::spawn(async move {
            let mut close_reason = None;
            while let Some(next) = ws_rx.next().await {
                let event = match next {
                    Ok(Message::Text(text)) => {
                        TransportEvent::Frame(Frame::Text(text.as_str().to_owned()))
                    }
                    Ok(Message::Binary(data)) => TransportEvent::Frame(Frame::Binary(data)),
                    Ok(Message::Ping(data)) => TransportEvent::Frame(Frame::Ping(data)),
                    Ok(Message::Pong(data)) => TransportEvent::Frame(Frame::Pong(data)),
                    Ok(Message::Close(frame)) => {
                        close_reason = frame.map(|f| format!("{}: {}", f.code, f.reason.as_str()));
                        break;
                    }
                    Ok(Message::Frame(_)) => continue,
                    Err(e) => {
                        let _ = events_tx.send(TransportEvent::Error(e.to_string()));
                        break;
                    }
                };
                if events_tx.send(event).is_err() {
                    break;
                }
            }
            reader_open.store(false, Ordering::SeqCst);
            let _ = events_tx.send(TransportEvent::Closed { reason: close_reason });
        });

        self.tasks.lock().extend([writer, reader]);
        tracing::debug!(url = %self.url, "WebSocket connected");
        Ok(events_rx)
    }

    async fn send(&self, frame: Frame) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::NotConnected);
        }
        let msg = match frame {
            Frame::Text(text) => Message::Text(text.into()),
            Frame::Binary(data) => Message::Binary(data),
            Frame::Ping(data) => Message::Ping(data),
            Frame::Pong(data) => Message::Pong(data),
        };
        let outbound = self.outbound.lock().clone();
        match outbound {
            Some(tx) => tx
                .send(msg)
                .map_err(|_| TransportError::Send("writer task ended".into())),
            None => Err(TransportError::NotConnected),
        }
    }

    async fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
        if let Some(tx) = self.outbound.lock().take() {
            let _ = tx.send(Message::Close(None));
        }
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

impl Drop for WebSocketTransport {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

/// Factory building a [`WebSocketTransport`] per address.
#[derive(Clone, Copy, Debug, Default)]
pub struct WebSocketFactory;

impl TransportFactory for WebSocketFactory {
    fn create(&self, address: &str) -> Arc<dyn Transport> {
        Arc::new(WebSocketTransport::new(address))
    }
}
