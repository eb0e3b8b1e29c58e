//! Namespaced in-process metrics: counters, gauges and bucketed histograms.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Clone)]
pub struct Histogram {
    buckets: Vec<u64>,
    counts: Vec<u64>,
}

impl Histogram {
    /// Buckets grow by 1.5x from 1 up to `max_value`.
    pub fn canonical(max_value: u64) -> Self {
        let mut buckets = Vec::new();
        let mut current = 1u64;
        while current < max_value {
            buckets.push(current);
            current = (current as f64 * 1.5).ceil() as u64;
        }
        buckets.push(max_value.max(1));
        let counts = vec![0; buckets.len()];
        Self { buckets, counts }
    }

    pub fn observe(&mut self, value: u64) {
        let idx = self
            .buckets
            .iter()
            .position(|bucket| value <= *bucket)
            .unwrap_or(self.buckets.len() - 1);
        self.counts[idx] = self.counts[idx].saturating_add(1);
    }

    pub fn buckets(&self) -> &[u64] {
        &self.buckets
    }

    pub fn total(&self) -> u64 {
        self.counts.iter().sum()
    }
}

#[derive(Debug, Default)]
struct MetricsState {
    counters: HashMap<String, Arc<AtomicU64>>,
    gauges: HashMap<String, Arc<AtomicU64>>,
    histograms: HashMap<String, Histogram>,
}

/// Cheaply cloneable handle onto one metrics namespace.
#[derive(Debug, Clone)]
pub struct SharedMetricsRegistry {
    namespace: Arc<String>,
    state: Arc<Mutex<MetricsState>>,
}

impl SharedMetricsRegistry {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: Arc::new(namespace.into()),
            state: Arc::new(Mutex::new(MetricsState::default())),
        }
    }

    pub fn inc_counter(&self, name: &str, delta: u64) -> u64 {
        let key = self.qualify(name);
        let cell = self.state.lock().counters.entry(key).or_default().clone();
        let previous = cell.fetch_add(delta, Ordering::Relaxed);
        previous.saturating_add(delta)
    }

    pub fn set_gauge(&self, name: &str, value: u64) {
        let key = self.qualify(name);
        let cell = self.state.lock().gauges.entry(key).or_default().clone();
        cell.store(value, Ordering::Relaxed);
    }

    pub fn register_histogram(&self, name: &str, max_value: u64) {
        let key = self.qualify(name);
        self.state
            .lock()
            .histograms
            .entry(key)
            .or_insert_with(|| Histogram::canonical(max_value));
    }

    pub fn observe_histogram(&self, name: &str, value: u64) -> Result<(), TelemetryError> {
        let key = self.qualify(name);
        let mut state = self.state.lock();
        let histogram = state
            .histograms
            .get_mut(&key)
            .ok_or(TelemetryError::UnknownHistogram(key.clone()))?;
        histogram.observe(value);
        Ok(())
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let state = self.state.lock();
        MetricsSnapshot {
            counters: state
                .counters
                .iter()
                .map(|(name, cell)| (name.clone(), cell.load(Ordering::Relaxed)))
                .collect(),
            gauges: state
                .gauges
                .iter()
                .map(|(name, cell)| (name.clone(), cell.load(Ordering::Relaxed)))
                .collect(),
            histograms: state
                .histograms
                .iter()
                .map(|(name, hist)| (name.clone(), hist.counts.clone()))
                .collect(),
        }
    }

    fn qualify(&self, name: &str) -> String {
        let prefix = format!("{}.", self.namespace.trim_end_matches('.'));
        if name.starts_with(&prefix) {
            name.to_string()
        } else {
            format!("{prefix}{name}")
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsSnapshot {
    pub counters: HashMap<String, u64>,
    pub gauges: HashMap<String, u64>,
    pub histograms: HashMap<String, Vec<u64>>,
}

impl MetricsSnapshot {
    pub fn counter(&self, name: &str) -> u64 {
        self.counters.get(name).copied().unwrap_or(0)
    }

    pub fn gauge(&self, name: &str) -> Option<u64> {
        self.gauges.get(name).copied()
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TelemetryError {
    #[error("unknown histogram {0}")]
    UnknownHistogram(String),
}
