//! Device reference: a validity flag, a lock, and counted holders.
//!
//! A `DevRef` tracks whether the physical binding behind a manager device
//! still exists, and how many parties are currently keeping it alive. The
//! usage protocol:
//!
//! - A party *holds* the reference between [`acquire`] and [`release`]
//!   (typically open → close). Holding does not imply the binding is
//!   usable.
//! - To *use* the binding, lock the reference and test validity; the lock
//!   doubles as the coarse mutex serializing all blocking-context
//!   mutations of the manager state:
//!
//!   ```rust,ignore
//!   let guard = devref.lock();
//!   guard.validate()?; // NotFound once the binding is gone
//!   /* ... mutate guarded state ... */
//!   drop(guard);
//!   ```
//!
//! - Hot-unplug invalidates the reference first, so no new holder can
//!   appear, then drops the owner's count; whoever releases the count to
//!   zero afterwards tears the binding down, exactly once.
//!
//! Holders that may establish external mappings register a holder
//! identity; the reference keeps a per-identity sub-count so teardown can
//! revoke each identity's mappings via [`for_each_holder`].
//!
//! [`acquire`]: DevRef::acquire
//! [`release`]: DevRefLock::release
//! [`for_each_holder`]: DevRef::for_each_holder

use arrayvec::ArrayVec;
use axerrno::{ax_err, AxResult};
use spin::{Mutex, MutexGuard};

/// Opaque identity of a reference holder (e.g. one open handle).
pub type HolderId = u64;

/// Bound on distinct holder identities tracked at once.
const MAX_HOLDERS: usize = 64;

struct HolderRef {
    id: HolderId,
    /// How many acquisitions this identity currently has.
    count: usize,
}

struct DevRefInner {
    /// The "pointer": false once the guarded binding is gone.
    valid: bool,
    /// How many parties hold the reference.
    count: usize,
    holders: ArrayVec<HolderRef, MAX_HOLDERS>,
}

/// Lock + validity + counted holders for one physical binding.
pub struct DevRef {
    inner: Mutex<DevRefInner>,
}

impl DevRef {
    /// Creates a valid reference. The count starts at 1: the creator holds
    /// the reference until it releases it during teardown.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(DevRefInner {
                valid: true,
                count: 1,
                holders: ArrayVec::new(),
            }),
        }
    }

    /// Locks the reference. This is the coarse lock of the owning manager;
    /// critical sections must not park while holding it.
    pub fn lock(&self) -> DevRefLock<'_> {
        DevRefLock {
            inner: self.inner.lock(),
        }
    }

    /// Acquires a holding, leaving the reference locked on success.
    ///
    /// # Errors
    ///
    /// `NotFound` if the reference was invalidated. `NoMemory` if a new
    /// holder identity cannot be recorded; the count change is rolled
    /// back. The reference is unlocked on any error.
    pub fn acquire_locked(&self, holder: Option<HolderId>) -> AxResult<DevRefLock<'_>> {
        let mut inner = self.inner.lock();
        if !inner.valid {
            return ax_err!(NotFound, "device is gone");
        }
        inner.count += 1;
        if let Some(id) = holder {
            if let Some(entry) = inner.holders.iter_mut().find(|h| h.id == id) {
                entry.count += 1;
            } else if inner.holders.try_push(HolderRef { id, count: 1 }).is_err() {
                inner.count -= 1;
                return ax_err!(NoMemory, "holder table full");
            }
        }
        Ok(DevRefLock { inner })
    }

    /// [`acquire_locked`] followed by an unlock.
    ///
    /// [`acquire_locked`]: DevRef::acquire_locked
    pub fn acquire(&self, holder: Option<HolderId>) -> AxResult {
        self.acquire_locked(holder).map(drop)
    }

    /// Invokes `callback` for every holder identity, with the reference
    /// unlocked around each call (callbacks may be slow, e.g. revoking
    /// address-space mappings) and re-locked between iterations.
    pub fn for_each_holder<F: FnMut(HolderId)>(&self, mut callback: F) {
        let mut index = 0;
        loop {
            let id = match self.inner.lock().holders.get(index) {
                Some(entry) => entry.id,
                None => break,
            };
            callback(id);
            index += 1;
        }
    }
}

impl Default for DevRef {
    fn default() -> Self {
        Self::new()
    }
}

/// The locked view of a [`DevRef`]. Unlocks on drop.
pub struct DevRefLock<'a> {
    inner: MutexGuard<'a, DevRefInner>,
}

impl DevRefLock<'_> {
    /// Whether the guarded binding still exists.
    #[inline]
    pub fn is_valid(&self) -> bool {
        self.inner.valid
    }

    /// `Ok` while valid, `NotFound` after invalidation.
    pub fn validate(&self) -> AxResult {
        if self.inner.valid {
            Ok(())
        } else {
            ax_err!(NotFound, "device is gone")
        }
    }

    /// Current holder count.
    pub fn count(&self) -> usize {
        self.inner.count
    }

    /// Marks the binding as gone. Every future [`DevRef::acquire`] fails
    /// with `NotFound`; existing holders keep draining via `release`.
    pub fn invalidate(&mut self) {
        self.inner.valid = false;
    }

    /// Drops one holding and unlocks; returns the remaining count. The
    /// caller may tear the binding down iff this returns zero — which can
    /// only be the final state if the reference was invalidated first, so
    /// no new holder can appear afterwards.
    pub fn release(mut self, holder: Option<HolderId>) -> usize {
        debug_assert!(self.inner.count > 0);
        self.inner.count -= 1;
        if let Some(id) = holder {
            match self.inner.holders.iter().position(|h| h.id == id) {
                Some(pos) => {
                    self.inner.holders[pos].count -= 1;
                    if self.inner.holders[pos].count == 0 {
                        self.inner.holders.remove(pos);
                    }
                }
                None => error!("released an unknown holder identity {id}"),
            }
        }
        self.inner.count
    }
}
