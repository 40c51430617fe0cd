use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;

/// Type of metric.
#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MetricType {
    Counter,
    Gauge,
}

/// Point-in-time value of one metric.
#[derive(Clone, Debug, Serialize)]
pub struct MetricSample {
    pub timestamp: String,
    pub name: String,
    pub value: i64,
    pub metric_type: MetricType,
}

/// In-memory counters and gauges keyed by name.
///
/// Names are created on first use; reads of unknown names return zero.
#[derive(Default)]
pub struct MetricsRecorder {
    counters: RwLock<BTreeMap<String, AtomicU64>>,
    gauges: RwLock<BTreeMap<String, AtomicI64>>,
}

impl MetricsRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment_counter(&self, name: &str, n: u64) {
        if let Some(counter) = self.counters.read().get(name) {
            counter.fetch_add(n, Ordering::Relaxed);
            return;
        }
        self.counters
            .write()
            .entry(name.to_string())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_gauge(&self, name: &str, delta: i64) {
        if let Some(gauge) = self.gauges.read().get(name) {
            gauge.fetch_add(delta, Ordering::Relaxed);
            return;
        }
        self.gauges
            .write()
            .entry(name.to_string())
            .or_insert_with(|| AtomicI64::new(0))
            .fetch_add(delta, Ordering::Relaxed);
    }

    pub fn set_gauge(&self, name: &str, value: i64) {
        if let Some(gauge) = self.gauges.read().get(name) {
            gauge.store(value, Ordering::Relaxed);
            return;
        }
        self.gauges
            .write()
            .entry(name.to_string())
            .or_insert_with(|| AtomicI64::new(0))
            .store(value, Ordering::Relaxed);
    }

    pub fn counter(&self, name: &str) -> u64 {
        self.counters
            .read()
            .get(name)
            .map_or(0, |c| c.load(Ordering::Relaxed))
    }

    pub fn gauge(&self, name: &str) -> i64 {
        self.gauges
            .read()
            .get(name)
            .map_or(0, |g| g.load(Ordering::Relaxed))
    }

    /// All metrics, counters first, each group sorted by name.
    pub fn snapshot(&self) -> Vec<MetricSample> {
        let timestamp = Utc::now().to_rfc3339();
        let mut samples = Vec::new();
        for (name, counter) in self.counters.read().iter() {
            samples.push(MetricSample {
                timestamp: timestamp.clone(),
                name: name.clone(),
                value: counter.load(Ordering::Relaxed) as i64,
                metric_type: MetricType::Counter,
            });
        }
        for (name, gauge) in self.gauges.read().iter() {
            samples.push(MetricSample {
                timestamp: timestamp.clone(),
                name: name.clone(),
                value: gauge.load(Ordering::Relaxed),
                metric_type: MetricType::Gauge,
            });
        }
        samples
    }
}
