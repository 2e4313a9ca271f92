// vim: tw=80
//! Common utility functions used throughout the RAID engine

use std::{
    ops::{Add, Div, Sub},
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering}
    }
};

/// Types that can be used with `div_roundup`
pub trait RoundupAble {}
impl RoundupAble for u8 {}
impl RoundupAble for u16 {}
impl RoundupAble for u32 {}
impl RoundupAble for u64 {}
impl RoundupAble for usize {}

/// Divide two unsigned numbers (usually integers), rounding up.
pub fn div_roundup<T>(dividend: T, divisor: T) -> T
    where T: Add<Output=T> + Copy + Div<Output=T> + From<u8> + RoundupAble +
             Sub<Output=T> {
    (dividend + divisor - T::from(1u8)) / divisor
}

/// Counts the live instances of some bulk-freed structure, like stripe maps or
/// DAGs.
///
/// Each instance holds an [`Tracked`] token, so the count drops as soon as the
/// owning structure is dropped, however that happens.
#[derive(Clone, Debug, Default)]
pub struct AllocTracker(Arc<AtomicUsize>);

impl AllocTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// How many tracked objects are currently alive?
    pub fn live(&self) -> usize {
        self.0.load(Ordering::Acquire)
    }

    /// Register one new allocation.
    pub fn track(&self) -> Tracked {
        self.0.fetch_add(1, Ordering::AcqRel);
        Tracked(self.0.clone())
    }
}

/// Token for a single allocation counted by an [`AllocTracker`]
#[derive(Debug)]
pub struct Tracked(Arc<AtomicUsize>);

impl Drop for Tracked {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

// LCOV_EXCL_START
#[cfg(test)]
/// Helper to generate the runtime used by most unit tests
pub fn basic_runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .unwrap()
}

// LCOV_EXCL_STOP
