//! Lock-free primitives for cross-thread clock and flag publication.
//!
//! All wrappers are cache-line aligned to avoid false sharing between the
//! master thread (writer) and user threads (readers).

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

use arc_swap::ArcSwap;
use std::sync::Arc;

/// Cache-line aligned atomic tick-stamp cell.
///
/// Written only by the master thread, readable from any thread.
#[repr(align(64))]
#[derive(Debug)]
pub struct TickStampCell {
    value: AtomicU64,
}

impl TickStampCell {
    pub fn new(value: u64) -> Self {
        Self {
            value: AtomicU64::new(value),
        }
    }

    #[inline]
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set(&self, value: u64) {
        self.value.store(value, Ordering::Release);
    }

    /// Advance by `delta`, returning the new value.
    #[inline]
    pub fn add(&self, delta: u64) -> u64 {
        self.value.fetch_add(delta, Ordering::AcqRel) + delta
    }
}

impl Default for TickStampCell {
    fn default() -> Self {
        Self::new(0)
    }
}

/// Cache-line aligned atomic boolean flag.
#[repr(align(64))]
#[derive(Debug)]
pub struct AtomicFlag {
    value: AtomicBool,
}

impl AtomicFlag {
    pub fn new(value: bool) -> Self {
        Self {
            value: AtomicBool::new(value),
        }
    }

    #[inline]
    pub fn get(&self) -> bool {
        self.value.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set(&self, value: bool) {
        self.value.store(value, Ordering::Release);
    }
}

impl Default for AtomicFlag {
    fn default() -> Self {
        Self::new(false)
    }
}

/// A published pairing of the tick stamp with the system time at which the
/// master thread advanced it. Allows any thread to extrapolate a system
/// time onto the tick clock.
#[derive(Debug, Clone)]
pub struct ClockSnapshot {
    pub tick_stamp: u64,
    pub system_time: Instant,
    pub sample_freq: u32,
}

/// The engine clock: the authoritative tick stamp plus a lock-free
/// snapshot for systime extrapolation.
#[derive(Debug)]
pub(crate) struct Clock {
    stamp: TickStampCell,
    snapshot: ArcSwap<ClockSnapshot>,
}

impl Clock {
    pub fn new(sample_freq: u32) -> Self {
        Self {
            stamp: TickStampCell::new(0),
            snapshot: ArcSwap::from_pointee(ClockSnapshot {
                tick_stamp: 0,
                system_time: Instant::now(),
                sample_freq,
            }),
        }
    }

    #[inline]
    pub fn tick_stamp(&self) -> u64 {
        self.stamp.get()
    }

    /// Master thread only: advance the clock by one block and publish the
    /// new snapshot.
    pub fn advance(&self, block_size: u64, sample_freq: u32) -> u64 {
        let new = self.stamp.add(block_size);
        self.snapshot.store(Arc::new(ClockSnapshot {
            tick_stamp: new,
            system_time: Instant::now(),
            sample_freq,
        }));
        new
    }

    pub fn snapshot(&self) -> Arc<ClockSnapshot> {
        self.snapshot.load_full()
    }

    /// Extrapolate a system time onto the tick clock.
    pub fn tick_stamp_from_systime(&self, at: Instant) -> u64 {
        let snap = self.snapshot.load();
        let elapsed = at.saturating_duration_since(snap.system_time);
        snap.tick_stamp + (elapsed.as_secs_f64() * snap.sample_freq as f64) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tick_stamp_cell() {
        let cell = TickStampCell::new(0);
        assert_eq!(cell.get(), 0);
        cell.set(128);
        assert_eq!(cell.get(), 128);
        assert_eq!(cell.add(64), 192);
        assert_eq!(cell.get(), 192);
    }

    #[test]
    fn test_atomic_flag() {
        let flag = AtomicFlag::default();
        assert!(!flag.get());
        flag.set(true);
        assert!(flag.get());
    }

    #[test]
    fn test_clock_advance_and_extrapolate() {
        let clock = Clock::new(48000);
        assert_eq!(clock.tick_stamp(), 0);
        clock.advance(256, 48000);
        assert_eq!(clock.tick_stamp(), 256);
        let snap = clock.snapshot();
        assert_eq!(snap.tick_stamp, 256);
        // Extrapolation never goes backwards.
        assert!(clock.tick_stamp_from_systime(Instant::now()) >= 256);
    }
}
