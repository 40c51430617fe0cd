//! In-process transport for tests and local loops.
//!
//! [`MemoryTransport::pair`] returns the client side (a [`Transport`]) and a
//! [`MemoryPeer`] playing the remote action host.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::cache::TransportFactory;
use crate::error::TransportError;
use crate::transport::{Frame, Transport, TransportEvent};
use crate::wire::SessionMessage;

/// What the transport reports when started.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StartBehavior {
    Ready,
    Error(String),
    Close,
    /// Never becomes ready.
    Hang,
}

pub struct MemoryTransport {
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
    outbound_tx: mpsc::UnboundedSender<Frame>,
    open: Arc<AtomicBool>,
    behavior: StartBehavior,
    starts: AtomicUsize,
}

impl MemoryTransport {
    pub fn pair() -> (Self, MemoryPeer) {
        Self::pair_with(StartBehavior::Ready)
    }

    pub fn pair_with(behavior: StartBehavior) -> (Self, MemoryPeer) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let open = Arc::new(AtomicBool::new(false));
        let transport = Self {
            events_tx: events_tx.clone(),
            events_rx: Mutex::new(Some(events_rx)),
            outbound_tx,
            open: open.clone(),
            behavior,
            starts: AtomicUsize::new(0),
        };
        let peer = MemoryPeer {
            events_tx,
            outbound_rx,
            open,
        };
        (transport, peer)
    }

    pub fn start_count(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn name(&self) -> &str {
        "memory"
    }

    async fn start(&self) -> Result<mpsc::UnboundedReceiver<TransportEvent>, TransportError> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        let events = self
            .events_rx
            .lock()
            .take()
            .ok_or_else(|| TransportError::Connection("memory transport already started".into()))?;

        match &self.behavior {
            StartBehavior::Ready => {
                self.open.store(true, Ordering::SeqCst);
                let _ = self.events_tx.send(TransportEvent::Ready);
            }
            StartBehavior::Error(msg) => {
                let _ = self.events_tx.send(TransportEvent::Error(msg.clone()));
            }
            StartBehavior::Close => {
                let _ = self.events_tx.send(TransportEvent::Closed { reason: None });
            }
            StartBehavior::Hang => {}
        }
        Ok(events)
    }

    async fn send(&self, frame: Frame) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::NotConnected);
        }
        self.outbound_tx
            .send(frame)
            .map_err(|_| TransportError::Send("peer dropped".into()))
    }

    async fn close(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            let _ = self.events_tx.send(TransportEvent::Closed {
                reason: Some("closed locally".into()),
            });
        }
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

/// Remote end of a [`MemoryTransport`].
pub struct MemoryPeer {
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    outbound_rx: mpsc::UnboundedReceiver<Frame>,
    open: Arc<AtomicBool>,
}

impl MemoryPeer {
    /// Next message the client sent, skipping frames that are not JSON text.
    pub async fn recv(&mut self) -> Option<SessionMessage> {
        while let Some(frame) = self.outbound_rx.recv().await {
            if let Some(message) = decode_text(&frame) {
                return Some(message);
            }
        }
        None
    }

    /// Every message already sent by the client.
    pub fn drain(&mut self) -> Vec<SessionMessage> {
        let mut out = Vec::new();
        while let Ok(frame) = self.outbound_rx.try_recv() {
            if let Some(message) = decode_text(&frame) {
                out.push(message);
            }
        }
        out
    }

    pub fn send(&self, message: &SessionMessage) {
        if let Ok(json) = serde_json::to_string(message) {
            self.send_frame(Frame::Text(json));
        }
    }

    pub fn send_frame(&self, frame: Frame) {
        let _ = self.events_tx.send(TransportEvent::Frame(frame));
    }

    pub fn fail(&self, msg: impl Into<String>) {
        let _ = self.events_tx.send(TransportEvent::Error(msg.into()));
    }

    pub fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
        let _ = self.events_tx.send(TransportEvent::Closed {
            reason: Some("closed by peer".into()),
        });
    }

    /// Drop the link without telling the client.
    pub fn sever(&self) {
        self.open.store(false, Ordering::SeqCst);
    }
}

fn decode_text(frame: &Frame) -> Option<SessionMessage> {
    match frame {
        Frame::Text(text) => serde_json::from_str(text).ok(),
        _ => None,
    }
}

/// Factory handing out fresh memory pairs; peers arrive on the receiver
/// returned by [`MemoryNetwork::new`].
pub struct MemoryNetwork {
    peers: mpsc::UnboundedSender<(String, MemoryPeer)>,
}

impl MemoryNetwork {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<(String, MemoryPeer)>) {
        let (peers, rx) = mpsc::unbounded_channel();
        (Self { peers }, rx)
    }
}

impl TransportFactory for MemoryNetwork {
    fn create(&self, address: &str) -> Arc<dyn Transport> {
        let (transport, peer) = MemoryTransport::pair();
        let _ = self.peers.send((address.to_string(), peer));
        Arc::new(transport)
    }
}
