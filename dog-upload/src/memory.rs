use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use sysinfo::System;
use tracing::{debug, error, warn};

use crate::{Result, UploadError};

/// One reading of process-visible memory
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MemorySample {
    pub used_bytes: u64,
    pub total_bytes: u64,
}

impl MemorySample {
    pub fn new(used_bytes: u64, total_bytes: u64) -> Self {
        Self {
            used_bytes,
            total_bytes,
        }
    }

    /// Used / total; an unknown total reads as no pressure
    pub fn ratio(&self) -> f64 {
        if self.total_bytes == 0 {
            0.0
        } else {
            self.used_bytes as f64 / self.total_bytes as f64
        }
    }
}

/// Source of memory readings and reclamation hints
pub trait MemoryMonitor: Send + Sync {
    fn sample(&self) -> MemorySample;

    /// Best-effort request to give memory back; may do nothing
    fn reclaim(&self);
}

/// Reads host memory through `sysinfo`
pub struct SystemMemoryMonitor {
    system: Mutex<System>,
}

impl SystemMemoryMonitor {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_memory();
        Self {
            system: Mutex::new(system),
        }
    }
}

impl Default for SystemMemoryMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryMonitor for SystemMemoryMonitor {
    fn sample(&self) -> MemorySample {
        let mut system = self.system.lock();
        system.refresh_memory();
        MemorySample::new(system.used_memory(), system.total_memory())
    }

    fn reclaim(&self) {
        // Rust frees eagerly; dropped chunk slices are already returned to the allocator
        debug!("memory reclamation hint");
    }
}

/// Replays a fixed list of ratios, repeating the last one forever
///
/// Used to drive memory-pressure paths deterministically.
pub struct ScriptedMemoryMonitor {
    ratios: Mutex<VecDeque<f64>>,
    last: Mutex<f64>,
    samples: AtomicUsize,
    reclaims: AtomicUsize,
}

impl ScriptedMemoryMonitor {
    const TOTAL: u64 = 1 << 30;

    pub fn new<I: IntoIterator<Item = f64>>(ratios: I) -> Self {
        Self {
            ratios: Mutex::new(ratios.into_iter().collect()),
            last: Mutex::new(0.0),
            samples: AtomicUsize::new(0),
            reclaims: AtomicUsize::new(0),
        }
    }

    /// Always reports the same ratio
    pub fn constant(ratio: f64) -> Self {
        Self::new([ratio])
    }

    pub fn sample_count(&self) -> usize {
        self.samples.load(Ordering::SeqCst)
    }

    pub fn reclaim_count(&self) -> usize {
        self.reclaims.load(Ordering::SeqCst)
    }
}

impl MemoryMonitor for ScriptedMemoryMonitor {
    fn sample(&self) -> MemorySample {
        self.samples.fetch_add(1, Ordering::SeqCst);
        let mut last = self.last.lock();
        if let Some(next) = self.ratios.lock().pop_front() {
            *last = next;
        }
        MemorySample::new((Self::TOTAL as f64 * *last) as u64, Self::TOTAL)
    }

    fn reclaim(&self) {
        self.reclaims.fetch_add(1, Ordering::SeqCst);
    }
}

/// Applies the warning/critical thresholds around each memory-safe chunk
pub struct MemoryGuard<'a> {
    monitor: &'a dyn MemoryMonitor,
    warning: f64,
    critical: f64,
}

impl<'a> MemoryGuard<'a> {
    pub fn new(monitor: &'a dyn MemoryMonitor, warning: f64, critical: f64) -> Self {
        Self {
            monitor,
            warning,
            critical,
        }
    }

    /// Sample, reclaim above the warning ratio, and fail if still above critical
    pub async fn check(&self, chunk_index: usize) -> Result<f64> {
        let ratio = self.monitor.sample().ratio();
        if ratio <= self.warning {
            return Ok(ratio);
        }

        warn!(chunk_index, ratio, warning = self.warning, "memory above warning threshold, reclaiming");
        self.monitor.reclaim();
        tokio::task::yield_now().await;

        let ratio = self.monitor.sample().ratio();
        if ratio > self.critical {
            error!(chunk_index, ratio, critical = self.critical, "memory above critical threshold");
            return Err(UploadError::MemoryLimitExceeded {
                ratio,
                critical: self.critical,
                chunk_index,
            });
        }
        Ok(ratio)
    }

    /// Unconditional hint issued every N chunks
    pub fn reclaim(&self) {
        self.monitor.reclaim();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn low_pressure_passes_without_reclaim() {
        let monitor = ScriptedMemoryMonitor::constant(0.5);
        let guard = MemoryGuard::new(&monitor, 0.75, 0.9);
        assert_eq!(guard.check(0).await.unwrap(), 0.5);
        assert_eq!(monitor.reclaim_count(), 0);
        assert_eq!(monitor.sample_count(), 1);
    }

    #[tokio::test]
    async fn warning_reclaims_and_recovers() {
        let monitor = ScriptedMemoryMonitor::new([0.8, 0.6]);
        let guard = MemoryGuard::new(&monitor, 0.75, 0.9);
        let ratio = guard.check(3).await.unwrap();
        assert!((ratio - 0.6).abs() < 1e-6);
        assert_eq!(monitor.reclaim_count(), 1);
    }

    #[tokio::test]
    async fn critical_after_reclaim_fails() {
        let monitor = ScriptedMemoryMonitor::constant(0.95);
        let guard = MemoryGuard::new(&monitor, 0.75, 0.9);
        let err = guard.check(7).await.unwrap_err();
        assert!(matches!(err, UploadError::MemoryLimitExceeded { chunk_index: 7, .. }));
        assert!(!err.is_retryable());
    }

    #[test]
    fn system_monitor_reports_a_ratio() {
        let ratio = SystemMemoryMonitor::new().sample().ratio();
        assert!((0.0..=1.0).contains(&ratio));
    }
}
