//! Fast-path access gate and wait queue.
//!
//! `read`/`poll` and the mutex-free backend calls must stay responsive
//! even while slower administrative operations hold the device reference
//! mutex, so they are protected by [`AccessGate`] instead: an atomic word
//! packing a denied flag and an active-caller count. Teardown denies the
//! gate and then waits for the count to drain before freeing anything the
//! fast paths touch.
//!
//! The check-and-increment is a single CAS, so a caller can never slip in
//! between a denial and the drain.

use core::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

const DENIED: u32 = 1 << 31;
const COUNT_MASK: u32 = DENIED - 1;

/// Denied flag plus active-caller count in one atomic word.
///
/// Layout: `[denied(1 bit) | active_count(31 bits)]`.
#[derive(Debug, Default)]
pub struct AccessGate(AtomicU32);

impl AccessGate {
    /// Creates an open gate with no active callers.
    pub const fn new() -> Self {
        Self(AtomicU32::new(0))
    }

    /// Atomically enters the gate. Returns `false` if the gate is denied
    /// (or the count is saturated); the caller must not touch the guarded
    /// state in that case.
    #[inline]
    pub fn try_enter(&self) -> bool {
        loop {
            let current = self.0.load(Ordering::Acquire);
            if current & DENIED != 0 || current & COUNT_MASK == COUNT_MASK {
                return false;
            }
            match self.0.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(_) => continue,
            }
        }
    }

    /// Leaves the gate. Must pair with a successful [`try_enter`].
    ///
    /// [`try_enter`]: AccessGate::try_enter
    #[inline]
    pub fn exit(&self) {
        let prev = self.0.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev & COUNT_MASK > 0);
    }

    /// Denies all future entries. Callers already inside are unaffected;
    /// use [`active`] to wait them out.
    ///
    /// [`active`]: AccessGate::active
    pub fn deny(&self) {
        self.0.fetch_or(DENIED, Ordering::AcqRel);
    }

    /// Whether the gate has been denied.
    #[inline]
    pub fn is_denied(&self) -> bool {
        self.0.load(Ordering::Acquire) & DENIED != 0
    }

    /// Number of callers currently inside the gate.
    #[inline]
    pub fn active(&self) -> u32 {
        self.0.load(Ordering::Acquire) & COUNT_MASK
    }
}

/// Spin/yield wait queue for blocking-context waits.
///
/// Keeps a waiter count and a notification flag; waiters re-check their
/// condition on every notification and otherwise back off with
/// `spin_loop` hints. Critical sections on the waker side stay lock-free,
/// so it is safe to notify from the interrupt-equivalent context.
pub struct WaitQueue {
    waiters: AtomicUsize,
    notified: AtomicBool,
}

impl WaitQueue {
    /// Creates a wait queue with no waiters.
    pub const fn new() -> Self {
        Self {
            waiters: AtomicUsize::new(0),
            notified: AtomicBool::new(false),
        }
    }

    /// Waits until `condition` returns `true` or `max_spins` iterations
    /// elapse (`0` means no limit). Returns whether the condition was met.
    pub fn wait_until<F>(&self, mut condition: F, max_spins: usize) -> bool
    where
        F: FnMut() -> bool,
    {
        if condition() {
            return true;
        }

        self.waiters.fetch_add(1, Ordering::AcqRel);
        let mut spins = 0;

        loop {
            if condition() {
                self.waiters.fetch_sub(1, Ordering::AcqRel);
                return true;
            }

            if max_spins > 0 && spins >= max_spins {
                self.waiters.fetch_sub(1, Ordering::AcqRel);
                return false;
            }

            if self.notified.swap(false, Ordering::AcqRel) {
                continue;
            }

            for _ in 0..100 {
                core::hint::spin_loop();
            }
            spins += 100;
        }
    }

    /// Wakes every current waiter to re-check its condition.
    pub fn notify_all(&self) {
        if self.waiters.load(Ordering::Acquire) > 0 {
            self.notified.store(true, Ordering::Release);
        }
    }
}

impl Default for WaitQueue {
    fn default() -> Self {
        Self::new()
    }
}
