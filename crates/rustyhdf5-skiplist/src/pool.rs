//! Process-wide pool of forward-pointer arrays.
//!
//! Nodes keep their forward pointers in arrays whose length is a power of
//! two. Released arrays are parked in a per-size free list and handed out
//! again to the next node that needs that size, so promotion and node churn
//! do not hit the allocator.
//!
//! The pool is created on first use (or by [`init`]), only ever grows, and
//! is released by [`teardown`]. After teardown it is never touched again:
//! arrays are allocated and dropped directly.

use std::sync::{Mutex, MutexGuard};

use crate::list::Link;

/// Lifecycle phase of the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolPhase {
    /// Not used yet.
    Uninitialized,
    /// Caching released arrays.
    Active,
    /// Released; arrays bypass the pool from now on.
    TornDown,
}

/// Snapshot of the pool's contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Current lifecycle phase.
    pub phase: PoolPhase,
    /// Number of power-of-two size classes created so far.
    pub size_classes: usize,
    /// Arrays currently parked across all size classes.
    pub cached_arrays: usize,
}

enum PoolState {
    Uninitialized,
    Active(SizeClasses),
    TornDown,
}

#[derive(Default)]
struct SizeClasses {
    /// `free[log]` holds arrays of length `1 << log`.
    free: Vec<Vec<Box<[Link]>>>,
}

impl SizeClasses {
    fn class_mut(&mut self, log: u32) -> &mut Vec<Box<[Link]>> {
        let log = log as usize;
        if self.free.len() <= log {
            self.free.resize_with(log + 1, Vec::new);
        }
        &mut self.free[log]
    }
}

static POOL: Mutex<PoolState> = Mutex::new(PoolState::Uninitialized);

fn lock() -> MutexGuard<'static, PoolState> {
    // A panic while holding the lock cannot leave the free lists inconsistent.
    POOL.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn fresh(log: u32) -> Box<[Link]> {
    vec![None; 1usize << log].into_boxed_slice()
}

/// Create the pool if it has not been created yet.
///
/// Calling this after [`teardown`] has no effect.
pub fn init() {
    let mut state = lock();
    if matches!(*state, PoolState::Uninitialized) {
        *state = PoolState::Active(SizeClasses::default());
    }
}

/// Release every cached array and retire the pool for the rest of the
/// process lifetime.
pub fn teardown() {
    let mut state = lock();
    *state = PoolState::TornDown;
}

/// Report the current pool contents.
pub fn stats() -> PoolStats {
    let state = lock();
    match &*state {
        PoolState::Uninitialized => PoolStats {
            phase: PoolPhase::Uninitialized,
            size_classes: 0,
            cached_arrays: 0,
        },
        PoolState::Active(classes) => PoolStats {
            phase: PoolPhase::Active,
            size_classes: classes.free.len(),
            cached_arrays: classes.free.iter().map(Vec::len).sum(),
        },
        PoolState::TornDown => PoolStats {
            phase: PoolPhase::TornDown,
            size_classes: 0,
            cached_arrays: 0,
        },
    }
}

/// Take an array of `1 << log` empty links.
pub(crate) fn acquire(log: u32) -> Box<[Link]> {
    let mut state = lock();
    if matches!(*state, PoolState::Uninitialized) {
        *state = PoolState::Active(SizeClasses::default());
    }
    match &mut *state {
        PoolState::Active(classes) => classes.class_mut(log).pop().unwrap_or_else(|| fresh(log)),
        _ => fresh(log),
    }
}

/// Hand an array back. Its links are cleared before it is parked.
pub(crate) fn release(mut array: Box<[Link]>) {
    debug_assert!(array.len().is_power_of_two());
    let mut state = lock();
    if let PoolState::Active(classes) = &mut *state {
        array.iter_mut().for_each(|link| *link = None);
        let log = array.len().trailing_zeros();
        classes.class_mut(log).push(array);
    }
}
