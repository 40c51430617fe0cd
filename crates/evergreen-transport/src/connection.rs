//! Connection manager: one transport, many inbound-message observers.

use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::TransportError;
use crate::transport::{Frame, Transport, TransportEvent};
use crate::wire::SessionMessage;

/// Observer for decoded inbound messages. Lives as long as the manager.
pub type MessageCallback = Arc<dyn Fn(&SessionMessage) + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Open,
    Closed,
    Failed,
}

pub struct ConnectionManager {
    address: String,
    transport: Arc<dyn Transport>,
    state: RwLock<ConnectionState>,
    callbacks: RwLock<Vec<MessageCallback>>,
    last_error: RwLock<Option<TransportError>>,
    connect_lock: tokio::sync::Mutex<()>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionManager {
    pub fn new(address: impl Into<String>, transport: Arc<dyn Transport>) -> Arc<Self> {
        Arc::new(Self {
            address: address.into(),
            transport,
            state: RwLock::new(ConnectionState::Idle),
            callbacks: RwLock::new(Vec::new()),
            last_error: RwLock::new(None),
            connect_lock: tokio::sync::Mutex::new(()),
            dispatcher: Mutex::new(None),
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    pub fn last_error(&self) -> Option<TransportError> {
        self.last_error.read().clone()
    }

    /// False once the connection is known to be dead. A manager that has not
    /// connected yet is still usable.
    pub fn is_valid(&self) -> bool {
        match self.state() {
            ConnectionState::Idle | ConnectionState::Connecting => true,
            ConnectionState::Open => self.transport.is_open(),
            ConnectionState::Closed | ConnectionState::Failed => false,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Open && self.transport.is_open()
    }

    /// Start the transport and wait for it to become ready.
    ///
    /// Error or close before ready rejects the connect. Concurrent callers
    /// share one attempt.
    pub async fn connect(self: &Arc<Self>) -> Result<(), TransportError> {
        if self.is_connected() {
            return Ok(());
        }
        let _guard = self.connect_lock.lock().await;
        if self.is_connected() {
            return Ok(());
        }

        self.set_state(ConnectionState::Connecting);
        tracing::debug!(address = %self.address, transport = self.transport.name(), "Connecting");

        let mut events = match self.transport.start().await {
            Ok(events) => events,
            Err(e) => return Err(self.fail(e)),
        };

        // Frames that beat Ready are replayed once the dispatcher is wired.
        let mut early = Vec::new();
        loop {
            match events.recv().await {
                Some(TransportEvent::Ready) => break,
                Some(TransportEvent::Frame(frame)) => early.push(frame),
                Some(TransportEvent::Error(msg)) => {
                    return Err(self.fail(TransportError::Connection(msg)));
                }
                Some(TransportEvent::Closed { reason }) => {
                    let msg = format!(
                        "closed before ready: {}",
                        reason.as_deref().unwrap_or("no reason")
                    );
                    return Err(self.fail(TransportError::Connection(msg)));
                }
                None => {
                    return Err(self.fail(TransportError::Connection(
                        "event channel ended before ready".into(),
                    )));
                }
            }
        }

        self.set_state(ConnectionState::Open);
        tracing::info!(address = %self.address, transport = self.transport.name(), "Connection ready");

        for frame in &early {
            if let Err(e) = self.on_inbound_message(frame) {
                self.on_error(e);
            }
        }

        let handle = tokio::spawn(dispatch_events(Arc::downgrade(self), events));
        if let Some(previous) = self.dispatcher.lock().replace(handle) {
            previous.abort();
        }
        Ok(())
    }

    /// [`connect`](Self::connect) bounded by `timeout`. A timed-out attempt
    /// closes the transport and marks the manager failed.
    pub async fn connect_with_timeout(self: &Arc<Self>, timeout: Duration) -> Result<(), TransportError> {
        match tokio::time::timeout(timeout, self.connect()).await {
            Ok(result) => result,
            Err(_) => {
                self.transport.close().await;
                Err(self.fail(TransportError::ConnectTimeout(timeout)))
            }
        }
    }

    pub async fn disconnect(&self) {
        self.transport.close().await;
        self.set_state(ConnectionState::Closed);
        tracing::info!(address = %self.address, "Disconnected");
    }

    /// Serialize and write one message.
    pub async fn send(&self, message: &SessionMessage) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        let frame = self.transport.encode(message)?;
        self.transport.send(frame).await
    }

    /// Register an observer for every decoded inbound message.
    pub fn on_message<F>(&self, callback: F)
    where
        F: Fn(&SessionMessage) + Send + Sync + 'static,
    {
        self.callbacks.write().push(Arc::new(callback));
    }

    pub fn callback_count(&self) -> usize {
        self.callbacks.read().len()
    }

    /// Decode one raw frame and fan it out to every observer.
    pub fn on_inbound_message(&self, frame: &Frame) -> Result<(), TransportError> {
        let Some(message) = self.transport.decode(frame)? else {
            tracing::trace!(address = %self.address, "Control frame");
            return Ok(());
        };
        let callbacks = self.callbacks.read().clone();
        for callback in &callbacks {
            callback(&message);
        }
        Ok(())
    }

    fn on_error(&self, error: TransportError) {
        tracing::warn!(
            address = %self.address,
            kind = error.error_kind(),
            error = %error,
            "Transport error"
        );
        *self.last_error.write() = Some(error);
    }

    fn on_close(&self, reason: Option<String>) {
        tracing::info!(address = %self.address, reason = ?reason, "Transport closed");
        self.set_state(ConnectionState::Closed);
    }

    fn fail(&self, error: TransportError) -> TransportError {
        tracing::warn!(address = %self.address, error = %error, "Connect failed");
        self.set_state(ConnectionState::Failed);
        *self.last_error.write() = Some(error.clone());
        error
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.write() = state;
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Some(handle) = self.dispatcher.get_mut().take() {
            handle.abort();
        }
    }
}

/// Route transport events to the manager until the transport closes.
async fn dispatch_events(
    manager: Weak<ConnectionManager>,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(manager) = manager.upgrade() else {
            return;
        };
        match event {
            TransportEvent::Frame(frame) => {
                if let Err(e) = manager.on_inbound_message(&frame) {
                    manager.on_error(e);
                }
            }
            TransportEvent::Error(msg) => manager.on_error(TransportError::Connection(msg)),
            TransportEvent::Closed { reason } => {
                manager.on_close(reason);
                return;
            }
            TransportEvent::Ready => {}
        }
    }
    if let Some(manager) = manager.upgrade() {
        manager.on_close(None);
    }
}
