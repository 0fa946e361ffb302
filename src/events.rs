//! Event code bitmap and per-code subscriber dispatch table.
//!
//! Both structures are fixed-size: they are manipulated from the
//! interrupt-equivalent dispatch path, which must not allocate and must
//! complete in bounded time. Capacity exhaustion is an explicit error
//! (`StorageFull`), never a silent fallback to a growable collection.

use alloc::boxed::Box;
use alloc::vec::Vec;
use arrayvec::ArrayVec;
use axerrno::{ax_err, AxResult};

/// Size of the event code space. Codes at or above this are ignored by the
/// set operations and rejected by the dispatch table.
pub const MAX_EVENT_CODES: usize = 512;

/// Maximum number of subscribers per event code. Matches the maximum
/// number of virtual devices under one manager.
pub const MAX_SUBSCRIBERS: usize = 31;

const WORDS: usize = MAX_EVENT_CODES / 64;

/// Fixed-size bitmap over the event code space.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EventSet {
    bits: [u64; WORDS],
}

impl EventSet {
    /// Creates an empty set.
    pub const fn new() -> Self {
        Self { bits: [0; WORDS] }
    }

    /// Removes all codes from the set.
    pub fn clear(&mut self) {
        self.bits = [0; WORDS];
    }

    /// Tests whether `code` is in the set. Out-of-range codes are never in
    /// the set.
    pub fn test(&self, code: u16) -> bool {
        let code = code as usize;
        if code >= MAX_EVENT_CODES {
            return false;
        }
        self.bits[code / 64] & (1 << (code % 64)) != 0
    }

    /// Adds `code` to the set. Out-of-range codes are silently ignored.
    pub fn add(&mut self, code: u16) {
        let code = code as usize;
        if code < MAX_EVENT_CODES {
            self.bits[code / 64] |= 1 << (code % 64);
        }
    }

    /// Removes `code` from the set. Out-of-range codes are silently ignored.
    pub fn remove(&mut self, code: u16) {
        let code = code as usize;
        if code < MAX_EVENT_CODES {
            self.bits[code / 64] &= !(1 << (code % 64));
        }
    }

    /// Returns `true` if no code is set.
    pub fn is_empty(&self) -> bool {
        self.bits.iter().all(|w| *w == 0)
    }

    /// Removes and returns the lowest set code, or `None` if the set is
    /// empty. Used to drain one-shot notifications one at a time.
    pub fn extract_one(&mut self) -> Option<u16> {
        for (i, word) in self.bits.iter_mut().enumerate() {
            if *word != 0 {
                let bit = word.trailing_zeros() as usize;
                *word &= !(1 << bit);
                return Some((i * 64 + bit) as u16);
            }
        }
        None
    }
}

/// Per-event-code subscriber lists with a fixed fan-out bound.
///
/// `S` is the subscriber handle; the manager instantiates it with a
/// reference-counted virtual device state compared by device id. Entries
/// for one code keep their insertion order; removal compacts the list.
pub struct DispatchTable<S> {
    subs: Box<[ArrayVec<S, MAX_SUBSCRIBERS>]>,
}

impl<S: Clone + PartialEq> DispatchTable<S> {
    /// Creates a table with no subscribers.
    pub fn new() -> Self {
        let subs: Vec<ArrayVec<S, MAX_SUBSCRIBERS>> =
            (0..MAX_EVENT_CODES).map(|_| ArrayVec::new()).collect();
        Self {
            subs: subs.into_boxed_slice(),
        }
    }

    /// Subscribes `subscriber` to `code`. Adding an existing subscription
    /// is a no-op.
    ///
    /// # Errors
    ///
    /// `InvalidInput` for an out-of-range code, `StorageFull` when the
    /// per-code list is full.
    pub fn add(&mut self, subscriber: &S, code: u16) -> AxResult {
        let list = match self.subs.get_mut(code as usize) {
            Some(list) => list,
            None => return ax_err!(InvalidInput, "event code out of range"),
        };
        if list.contains(subscriber) {
            return Ok(());
        }
        if list.try_push(subscriber.clone()).is_err() {
            return ax_err!(StorageFull, "subscriber list full for event code");
        }
        Ok(())
    }

    /// Unsubscribes `subscriber` from `code`. A missing subscription or an
    /// out-of-range code is a no-op. The relative order of the remaining
    /// subscribers is preserved.
    pub fn remove(&mut self, subscriber: &S, code: u16) {
        if let Some(list) = self.subs.get_mut(code as usize) {
            if let Some(pos) = list.iter().position(|s| s == subscriber) {
                list.remove(pos);
            }
        }
    }

    /// Removes every subscription held by `subscriber`.
    pub fn remove_all(&mut self, subscriber: &S) {
        for code in 0..MAX_EVENT_CODES {
            self.remove(subscriber, code as u16);
        }
    }

    /// Sets, in `out`, every code that has at least one subscriber.
    pub fn collect_subscribed(&self, out: &mut EventSet) {
        for (code, list) in self.subs.iter().enumerate() {
            if !list.is_empty() {
                out.add(code as u16);
            }
        }
    }

    /// Sets, in `out`, every code `subscriber` is subscribed to.
    pub fn subscribed_codes_of(&self, subscriber: &S, out: &mut EventSet) {
        for (code, list) in self.subs.iter().enumerate() {
            if list.contains(subscriber) {
                out.add(code as u16);
            }
        }
    }

    /// Invokes `f` for every subscriber of `code`, in insertion order.
    pub fn for_subscribers(&self, code: u16, mut f: impl FnMut(&S)) {
        if let Some(list) = self.subs.get(code as usize) {
            for sub in list {
                f(sub);
            }
        }
    }

    /// Drops every subscription. Used during manager teardown.
    pub fn clear(&mut self) {
        for list in self.subs.iter_mut() {
            list.clear();
        }
    }
}

impl<S: Clone + PartialEq> Default for DispatchTable<S> {
    fn default() -> Self {
        Self::new()
    }
}
