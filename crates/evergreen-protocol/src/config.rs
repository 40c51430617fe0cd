use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::EvergreenError;

/// Engine configuration.
///
/// Every field has a default, so a partial JSON document is enough.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvergreenConfig {
    /// Address handed to the transport factory when a request names none.
    pub address: String,
    pub connect_timeout_ms: u64,
    /// Upper bound on fragments buffered for ids not yet mapped to an output.
    pub max_pending_fragments: usize,
    /// Capacity of the per-invocation outbound fragment queue.
    pub send_queue: usize,
}

impl Default for EvergreenConfig {
    fn default() -> Self {
        Self {
            address: "ws://127.0.0.1:9092/session".into(),
            connect_timeout_ms: 10_000,
            max_pending_fragments: 1024,
            send_queue: 256,
        }
    }
}

impl EvergreenConfig {
    pub fn from_json(raw: &str) -> Result<Self, EvergreenError> {
        let config: Self =
            serde_json::from_str(raw).map_err(|e| EvergreenError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, EvergreenError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| EvergreenError::Config(format!("{}: {e}", path.display())))?;
        Self::from_json(&raw)
    }

    /// Apply `EVERGREEN_*` variables from the process environment.
    pub fn with_env_overrides(self) -> Result<Self, EvergreenError> {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary lookup keyed by `EVERGREEN_*` names.
    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self, EvergreenError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(address) = lookup("EVERGREEN_ADDRESS") {
            self.address = address;
        }
        if let Some(raw) = lookup("EVERGREEN_CONNECT_TIMEOUT_MS") {
            self.connect_timeout_ms = parse_number("EVERGREEN_CONNECT_TIMEOUT_MS", &raw)?;
        }
        if let Some(raw) = lookup("EVERGREEN_MAX_PENDING_FRAGMENTS") {
            self.max_pending_fragments = parse_number("EVERGREEN_MAX_PENDING_FRAGMENTS", &raw)?;
        }
        if let Some(raw) = lookup("EVERGREEN_SEND_QUEUE") {
            self.send_queue = parse_number("EVERGREEN_SEND_QUEUE", &raw)?;
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), EvergreenError> {
        if self.send_queue == 0 {
            return Err(EvergreenError::Config("send_queue must be at least 1".into()));
        }
        if self.max_pending_fragments == 0 {
            return Err(EvergreenError::Config(
                "max_pending_fragments must be at least 1".into(),
            ));
        }
        if self.connect_timeout_ms == 0 {
            return Err(EvergreenError::Config("connect_timeout_ms must be positive".into()));
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T, EvergreenError> {
    raw.trim()
        .parse()
        .map_err(|_| EvergreenError::Config(format!("{key}: not a number: {raw:?}")))
}
