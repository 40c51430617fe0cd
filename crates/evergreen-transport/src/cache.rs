use std::collections::HashMap;
use std::sync::Arc;

use evergreen_core::SessionId;
use parking_lot::Mutex;

use crate::connection::ConnectionManager;
use crate::transport::Transport;

/// Builds a fresh transport for an address.
pub trait TransportFactory: Send + Sync {
    fn create(&self, address: &str) -> Arc<dyn Transport>;
}

impl<F> TransportFactory for F
where
    F: Fn(&str) -> Arc<dyn Transport> + Send + Sync,
{
    fn create(&self, address: &str) -> Arc<dyn Transport> {
        self(address)
    }
}

/// One connection manager per session, replaced lazily once invalid.
///
/// The cache never connects; callers do.
pub struct ConnectionCache {
    managers: Mutex<HashMap<SessionId, Arc<ConnectionManager>>>,
    factory: Arc<dyn TransportFactory>,
}

impl ConnectionCache {
    pub fn new(factory: Arc<dyn TransportFactory>) -> Self {
        Self {
            managers: Mutex::new(HashMap::new()),
            factory,
        }
    }

    /// Cached manager for `session_id` if still valid, otherwise a new one
    /// built for `address`.
    pub fn get_connection(&self, session_id: &SessionId, address: &str) -> Arc<ConnectionManager> {
        let mut managers = self.managers.lock();
        if let Some(existing) = managers.get(session_id) {
            if existing.is_valid() {
                return Arc::clone(existing);
            }
            tracing::info!(
                session_id = %session_id,
                state = ?existing.state(),
                "Evicting invalid connection"
            );
        }
        let manager = ConnectionManager::new(address, self.factory.create(address));
        managers.insert(session_id.clone(), Arc::clone(&manager));
        tracing::debug!(session_id = %session_id, address, "Created connection manager");
        manager
    }

    pub fn evict(&self, session_id: &SessionId) -> Option<Arc<ConnectionManager>> {
        self.managers.lock().remove(session_id)
    }

    /// Disconnect and forget every cached manager.
    pub async fn close_all(&self) {
        let managers: Vec<_> = self.managers.lock().drain().map(|(_, m)| m).collect();
        for manager in managers {
            manager.disconnect().await;
        }
    }

    pub fn len(&self) -> usize {
        self.managers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
