//! Gauges reported by the dispatcher

use std::sync::atomic::{AtomicUsize, Ordering};

pub trait Metrics: Send + Sync + 'static {
    /// Number of runnable checks seen at the start of a dispatch cycle
    fn set_checks_queue_size(&self, size: usize);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl Metrics for NoopMetrics {
    fn set_checks_queue_size(&self, _size: usize) {}
}

/// In-process gauges, readable by whatever exports them
#[derive(Debug, Default)]
pub struct GaugeMetrics {
    checks_queue_size: AtomicUsize,
}

impl GaugeMetrics {
    pub fn checks_queue_size(&self) -> usize {
        self.checks_queue_size.load(Ordering::Relaxed)
    }
}

impl Metrics for GaugeMetrics {
    fn set_checks_queue_size(&self, size: usize) {
        self.checks_queue_size.store(size, Ordering::Relaxed);
    }
}
