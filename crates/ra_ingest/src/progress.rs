use std::sync::atomic::{AtomicUsize, Ordering};

/// Finished/total counter shared by the slots and the sequencer.
///
/// Every bundle is finished exactly once, whether it was written, skipped or
/// failed.
#[derive(Debug)]
pub struct Progress {
    finished: AtomicUsize,
    total: usize,
}

impl Progress {
    pub fn new(total: usize) -> Self {
        Self {
            finished: AtomicUsize::new(0),
            total,
        }
    }

    /// Mark one bundle finished; returns the new finished count.
    pub fn finish(&self) -> usize {
        self.finished.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn finished(&self) -> usize {
        self.finished.load(Ordering::SeqCst)
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn is_complete(&self) -> bool {
        self.finished() >= self.total
    }
}

/// Number of bundles currently between manifest read and upload completion,
/// with the highest value seen.
#[derive(Debug, Default)]
pub struct PhaseGauge {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl PhaseGauge {
    /// Count one bundle in; it leaves again when the guard is dropped.
    pub fn enter(&self) -> PhaseGuard<'_> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        PhaseGuard { gauge: self }
    }

    pub fn current(&self) -> usize {
        self.current.load(Ordering::SeqCst)
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

pub struct PhaseGuard<'a> {
    gauge: &'a PhaseGauge,
}

impl Drop for PhaseGuard<'_> {
    fn drop(&mut self) {
        self.gauge.current.fetch_sub(1, Ordering::SeqCst);
    }
}
