//! Size accounting and threshold warnings.

use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

/// 5 × 10⁹ bytes.
pub const DEFAULT_WARNING_THRESHOLD_BYTES: u64 = 5_000_000_000;

const BYTES_PER_GB: f64 = 1_000_000_000.0;
const BYTES_PER_MB: f64 = 1_000_000.0;

/// Entry count and byte total for a namespace or the whole cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SizeReport {
    pub entry_count: usize,
    pub total_bytes: u64,
}

impl SizeReport {
    pub fn add(mut self, other: SizeReport) -> Self {
        self.entry_count += other.entry_count;
        self.total_bytes += other.total_bytes;
        self
    }

    pub fn total_mb(&self) -> f64 {
        self.total_bytes as f64 / BYTES_PER_MB
    }

    pub fn total_gb(&self) -> f64 {
        self.total_bytes as f64 / BYTES_PER_GB
    }
}

pub fn gb_to_bytes(gb: f64) -> u64 {
    if gb.is_finite() && gb > 0.0 {
        (gb * BYTES_PER_GB).round() as u64
    } else {
        0
    }
}

pub fn bytes_to_gb(bytes: u64) -> f64 {
    bytes as f64 / BYTES_PER_GB
}

pub fn bytes_to_mb(bytes: u64) -> f64 {
    bytes as f64 / BYTES_PER_MB
}

/// Emitted once each time the aggregate size crosses the threshold upward.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SizeWarning {
    pub total_bytes: u64,
    pub threshold_bytes: u64,
}

impl std::fmt::Display for SizeWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "cache size ({:.2} GB) exceeds warning threshold ({:.2} GB); export and clear the cache or raise the threshold",
            bytes_to_gb(self.total_bytes),
            bytes_to_gb(self.threshold_bytes)
        )
    }
}

/// Destination for [`SizeWarning`] events.
pub trait WarningSink: Send + Sync {
    fn warn(&self, warning: &SizeWarning);
}

/// Default sink: logs through `tracing`.
pub struct TracingWarningSink;

impl WarningSink for TracingWarningSink {
    fn warn(&self, warning: &SizeWarning) {
        tracing::warn!(
            total_bytes = warning.total_bytes,
            threshold_bytes = warning.threshold_bytes,
            "{}",
            warning
        );
    }
}

/// In-memory sink for testing.
#[derive(Default)]
pub struct InMemoryWarningSink {
    events: RwLock<Vec<SizeWarning>>,
}

impl InMemoryWarningSink {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn events(&self) -> Vec<SizeWarning> {
        self.events
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
    pub fn len(&self) -> usize {
        self.events.read().unwrap_or_else(PoisonError::into_inner).len()
    }
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl WarningSink for InMemoryWarningSink {
    fn warn(&self, warning: &SizeWarning) {
        self.events
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(warning.clone());
    }
}

/// Edge-triggered threshold check over aggregate cache size.
///
/// Fires when the total goes from at-or-below the threshold to above it.
/// Re-arms when the total drops back, when warnings are re-enabled, or when
/// the threshold changes.
pub struct SizeMonitor {
    threshold_bytes: AtomicU64,
    enabled: AtomicBool,
    above: AtomicBool,
    sink: RwLock<Arc<dyn WarningSink>>,
}

impl SizeMonitor {
    pub fn new(threshold_bytes: u64, enabled: bool) -> Self {
        Self {
            threshold_bytes: AtomicU64::new(threshold_bytes),
            enabled: AtomicBool::new(enabled),
            above: AtomicBool::new(false),
            sink: RwLock::new(Arc::new(TracingWarningSink)),
        }
    }

    pub fn with_sink(self, sink: Arc<dyn WarningSink>) -> Self {
        self.set_sink(sink);
        self
    }

    pub fn set_sink(&self, sink: Arc<dyn WarningSink>) {
        *self.sink.write().unwrap_or_else(PoisonError::into_inner) = sink;
    }

    pub fn threshold_bytes(&self) -> u64 {
        self.threshold_bytes.load(Ordering::Relaxed)
    }

    pub fn set_threshold_bytes(&self, bytes: u64) {
        self.threshold_bytes.store(bytes, Ordering::Relaxed);
        self.above.store(false, Ordering::Relaxed);
    }

    pub fn warnings_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn enable_warnings(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
        if enabled {
            self.above.store(false, Ordering::Relaxed);
        }
    }

    /// Compare `total_bytes` to the threshold; returns the warning if one fired.
    pub fn check_threshold(&self, total_bytes: u64) -> Option<SizeWarning> {
        let threshold = self.threshold_bytes();
        if total_bytes <= threshold {
            self.above.store(false, Ordering::Relaxed);
            return None;
        }
        if !self.warnings_enabled() {
            return None;
        }
        // Only the caller that flips the flag reports the crossing.
        if self.above.swap(true, Ordering::AcqRel) {
            return None;
        }
        let warning = SizeWarning {
            total_bytes,
            threshold_bytes: threshold,
        };
        let sink = self
            .sink
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        sink.warn(&warning);
        Some(warning)
    }
}

impl Default for SizeMonitor {
    fn default() -> Self {
        Self::new(DEFAULT_WARNING_THRESHOLD_BYTES, true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor(threshold: u64) -> (SizeMonitor, Arc<InMemoryWarningSink>) {
        let sink = Arc::new(InMemoryWarningSink::new());
        (SizeMonitor::new(threshold, true).with_sink(sink.clone()), sink)
    }

    #[test]
    fn test_fires_once_per_crossing() {
        let (m, sink) = monitor(100);
        assert!(m.check_threshold(50).is_none());
        assert!(m.check_threshold(150).is_some());
        assert!(m.check_threshold(200).is_none());
        assert!(m.check_threshold(300).is_none());
        assert_eq!(sink.len(), 1);

        // Drop below, cross again.
        assert!(m.check_threshold(90).is_none());
        assert!(m.check_threshold(101).is_some());
        assert_eq!(sink.len(), 2);
    }

    #[test]
    fn test_disabled_never_fires_and_reenable_rearms() {
        let (m, sink) = monitor(100);
        m.enable_warnings(false);
        assert!(m.check_threshold(500).is_none());
        m.enable_warnings(true);
        assert!(m.check_threshold(500).is_some());
        m.enable_warnings(false);
        m.enable_warnings(true);
        assert!(m.check_threshold(600).is_some());
        assert_eq!(sink.len(), 2);
    }

    #[test]
    fn test_threshold_change_takes_effect_immediately() {
        let (m, sink) = monitor(DEFAULT_WARNING_THRESHOLD_BYTES);
        assert!(m.check_threshold(2_000).is_none());
        m.set_threshold_bytes(gb_to_bytes(0.000001));
        assert_eq!(m.threshold_bytes(), 1_000);
        let w = m.check_threshold(2_000).unwrap();
        assert_eq!(w.threshold_bytes, 1_000);
        assert_eq!(sink.events()[0].total_bytes, 2_000);
    }

    #[test]
    fn test_gb_conversions() {
        assert_eq!(gb_to_bytes(5.0), DEFAULT_WARNING_THRESHOLD_BYTES);
        assert_eq!(gb_to_bytes(-1.0), 0);
        assert_eq!(gb_to_bytes(f64::NAN), 0);
        assert!((bytes_to_gb(2_500_000_000) - 2.5).abs() < 1e-9);
        let r = SizeReport { entry_count: 1, total_bytes: 1_500_000 }.add(SizeReport {
            entry_count: 2,
            total_bytes: 500_000,
        });
        assert_eq!(r.entry_count, 3);
        assert!((r.total_mb() - 2.0).abs() < 1e-9);
    }
}
