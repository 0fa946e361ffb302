//! Virtual device state and the open-handle surface.
//!
//! A virtual device owns a slice of the physical binding: its allocated
//! resources, its subscriptions, a one-shot notification set, and a
//! bounded event queue. Consumers interact through [`VdevHandle`], which
//! holds one counted reference on the parent manager for as long as it is
//! open.
//!
//! `read` and `poll` deliberately avoid the manager's coarse mutex: a
//! high-priority reader must not be blocked behind slow administrative
//! calls. They are guarded by the per-device [`AccessGate`] instead,
//! which teardown denies and drains.

use alloc::sync::Arc;
use alloc::vec::Vec;
use arrayvec::{ArrayString, ArrayVec};
use axerrno::{ax_err, AxResult};
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use spin::Mutex;

use crate::config::MAX_NAME_LEN;
use crate::dev_cell::DevCell;
use crate::devref::HolderId;
use crate::events::EventSet;
use crate::gate::{AccessGate, WaitQueue};
use crate::mngdev::MngCore;
use crate::queue::{EventQueue, EventRecord, MAX_PAYLOAD};
use crate::rm::{VresDesc, MAX_RES_TYPES};

/// Maximum allocated resources of one type per virtual device.
pub const MAX_RES_PER_VDEV: usize = 32;

/// Subscription mutation selector.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubscribeAction {
    /// Subscribe to one event code.
    Subscribe,
    /// Unsubscribe from one event code.
    Unsubscribe,
    /// Drop every subscription of the device.
    ClearAll,
}

/// Status snapshot of a virtual device.
#[derive(Clone, Debug)]
pub struct VdevStatus {
    pub id: u8,
    pub name: ArrayString<MAX_NAME_LEN>,
    /// Number of open handles.
    pub open_count: u32,
}

/// Allocated resources of one virtual device, per type, device-relative.
///
/// Guarded by the parent manager's coarse lock.
pub(crate) struct VdevResources {
    per_type: [ArrayVec<usize, MAX_RES_PER_VDEV>; MAX_RES_TYPES],
}

impl VdevResources {
    pub(crate) fn new() -> Self {
        Self {
            per_type: [const { ArrayVec::new_const() }; MAX_RES_TYPES],
        }
    }

    /// Records an allocated unit. The caller checks capacity beforehand.
    pub(crate) fn add(&mut self, desc: VresDesc) -> AxResult {
        let list = match self.per_type.get_mut(desc.res_type) {
            Some(list) => list,
            None => return ax_err!(InvalidInput, "resource type out of range"),
        };
        if list.try_push(desc.index).is_err() {
            return ax_err!(StorageFull, "per-device resource table full");
        }
        Ok(())
    }

    /// Number of units of `res_type` held by this device.
    pub(crate) fn count_for(&self, res_type: usize) -> usize {
        self.per_type.get(res_type).map_or(0, |l| l.len())
    }

    /// Translates a device-relative index into the absolute descriptor.
    pub(crate) fn resolve(&self, res_type: usize, rel_index: usize) -> Option<VresDesc> {
        let index = *self.per_type.get(res_type)?.get(rel_index)?;
        Some(VresDesc { res_type, index })
    }

    /// Iterates every owned unit.
    pub(crate) fn iter_all(&self) -> impl Iterator<Item = VresDesc> + '_ {
        self.per_type
            .iter()
            .enumerate()
            .flat_map(|(res_type, list)| {
                list.iter().map(move |&index| VresDesc { res_type, index })
            })
    }
}

/// Per-virtual-device state shared between the admin surface, the
/// readers, and the interrupt-equivalent dispatch path.
pub(crate) struct VdevState {
    pub(crate) id: u8,
    pub(crate) name: ArrayString<MAX_NAME_LEN>,
    pub(crate) res: DevCell<VdevResources>,
    /// Open-handle count; resources must not change while non-zero.
    pub(crate) usage: AtomicU32,
    /// Skip the hardware idle-reset on last close.
    pub(crate) retain_on_close: AtomicBool,
    /// One-shot notification codes. Short-hold lock, shared with the
    /// dispatch path.
    pub(crate) notified: Mutex<EventSet>,
    pub(crate) queue: EventQueue,
    /// Serializes queue consumers.
    reader: Mutex<()>,
    pub(crate) wait: WaitQueue,
    pub(crate) gate: AccessGate,
}

impl VdevState {
    pub(crate) fn new(id: u8, name: ArrayString<MAX_NAME_LEN>) -> Self {
        Self {
            id,
            name,
            res: DevCell::new(VdevResources::new()),
            usage: AtomicU32::new(0),
            retain_on_close: AtomicBool::new(false),
            notified: Mutex::new(EventSet::new()),
            queue: EventQueue::new(),
            reader: Mutex::new(()),
            wait: WaitQueue::new(),
            gate: AccessGate::new(),
        }
    }

    /// Whether a reader would get at least one record right now.
    pub(crate) fn has_data(&self) -> bool {
        if self.queue.is_available() {
            return true;
        }
        !self.notified.lock().is_empty()
    }

    /// Takes the next record: one-shot notifications drain before queued
    /// events.
    fn take_one(&self) -> Option<EventRecord> {
        if let Some(code) = self.notified.lock().extract_one() {
            return Some(EventRecord::new(code, &[]));
        }
        let _consumer = self.reader.lock();
        self.queue.pop()
    }

    /// Delivers one event from the interrupt-equivalent context. Called
    /// under the manager's dispatch lock. `payload` of `None` marks the
    /// code in the notification set instead of queueing a full record.
    pub(crate) fn deliver(&self, code: u16, payload: Option<&[u8]>) {
        match payload {
            None => {
                self.notified.lock().add(code);
                self.wait.notify_all();
            }
            Some(data) => {
                // a dropped event (queue saturated) must not wake readers
                if self.queue.push(code, data).is_ok() {
                    self.wait.notify_all();
                }
            }
        }
    }

    /// Denies the fast paths, wakes blocked readers, and spins until the
    /// last one has left. Teardown only.
    pub(crate) fn quiesce(&self) {
        self.gate.deny();
        self.wait.notify_all();
        while self.gate.active() > 0 {
            core::hint::spin_loop();
        }
    }
}

// Dispatch-table identity: one entry per device id.
impl PartialEq for VdevState {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

/// An open handle on a virtual device.
///
/// Dropping the handle closes it; [`close`](VdevHandle::close) does the
/// same explicitly. The handle holds one reference on the parent manager,
/// so a hot-unplugged manager is only freed after the last handle goes
/// away.
pub struct VdevHandle {
    core: Arc<MngCore>,
    state: Arc<VdevState>,
    holder: HolderId,
    nonblocking: AtomicBool,
    closed: AtomicBool,
}

impl VdevHandle {
    pub(crate) fn new(core: Arc<MngCore>, state: Arc<VdevState>, holder: HolderId) -> Self {
        Self {
            core,
            state,
            holder,
            nonblocking: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    /// Id of the virtual device.
    pub fn id(&self) -> u8 {
        self.state.id
    }

    /// Name of the virtual device.
    pub fn name(&self) -> &str {
        &self.state.name
    }

    /// Switches `read` between blocking (default) and non-blocking mode.
    pub fn set_nonblocking(&self, nonblocking: bool) {
        self.nonblocking.store(nonblocking, Ordering::Relaxed);
    }

    /// Reads pending events: one-shot notifications first, then queued
    /// records, up to `max_bytes` of record data (each record accounts
    /// for its code plus payload). Blocks until at least one record is
    /// available unless non-blocking mode is set.
    ///
    /// # Errors
    ///
    /// `InvalidInput` if `max_bytes` cannot fit one full record,
    /// `WouldBlock` in non-blocking mode with nothing pending, `NotFound`
    /// if the device went away or the handle was closed while waiting.
    pub fn read(&self, max_bytes: usize) -> AxResult<Vec<EventRecord>> {
        const RECORD_MAX: usize = 2 + MAX_PAYLOAD;
        let state = &*self.state;

        if max_bytes < RECORD_MAX {
            return ax_err!(InvalidInput, "read buffer below one full record");
        }
        if !state.gate.try_enter() {
            return ax_err!(NotFound, "device is gone");
        }

        let mut out = Vec::new();
        let mut budget = max_bytes;
        loop {
            while budget >= RECORD_MAX {
                match state.take_one() {
                    Some(record) => {
                        budget -= record.wire_len();
                        out.push(record);
                    }
                    None => break,
                }
            }
            if !out.is_empty() || budget < RECORD_MAX {
                break;
            }
            if self.nonblocking.load(Ordering::Relaxed) {
                state.gate.exit();
                return ax_err!(WouldBlock);
            }

            // Leave the fast path before sleeping so teardown can drain;
            // wake on new data, on cancellation from close, or on
            // teardown denying the gate.
            state.gate.exit();
            state.wait.wait_until(
                || {
                    state.has_data()
                        || state.gate.is_denied()
                        || self.closed.load(Ordering::Acquire)
                },
                0,
            );
            if self.closed.load(Ordering::Acquire) {
                return ax_err!(NotFound, "closed while reading");
            }
            if !state.gate.try_enter() {
                return ax_err!(NotFound, "device is gone");
            }
        }

        state.gate.exit();
        Ok(out)
    }

    /// Non-blocking readiness check mirroring `read`'s availability test.
    pub fn poll(&self) -> AxResult<bool> {
        if !self.state.gate.try_enter() {
            return ax_err!(NotFound, "device is gone");
        }
        let ready = self.state.has_data();
        self.state.gate.exit();
        Ok(ready)
    }

    /// Mutates this device's subscriptions and pushes the new aggregate
    /// to the backend.
    pub fn subscribe(&self, code: u16, action: SubscribeAction) -> AxResult {
        self.core.vdev_subscribe(&self.state, code, action)
    }

    /// Status snapshot.
    pub fn status(&self) -> AxResult<VdevStatus> {
        let guard = self.core.devref.lock();
        guard.validate()?;
        Ok(VdevStatus {
            id: self.state.id,
            name: self.state.name,
            open_count: self.state.usage.load(Ordering::Relaxed),
        })
    }

    /// Number of resources of `res_type` allocated to this device.
    pub fn res_status(&self, res_type: usize) -> AxResult<usize> {
        self.core.vdev_res_status(&self.state, res_type)
    }

    /// Backend command on this device, optionally naming one owned
    /// resource by its device-relative `(type, index)`.
    pub fn ioctl(
        &self,
        vres: Option<(usize, usize)>,
        cmd: u32,
        arg: &mut [u8],
    ) -> AxResult<usize> {
        self.core.vdev_ioctl(&self.state, vres, cmd, arg)
    }

    /// Backend command that bypasses the coarse lock; protected against
    /// teardown by the access gate only.
    pub fn direct_ioctl(&self, cmd: u32, arg: &mut [u8]) -> AxResult<usize> {
        if !self.state.gate.try_enter() {
            return ax_err!(NotFound, "device is gone");
        }
        let ret = self.core.hw.direct_ioctl(cmd, arg);
        self.state.gate.exit();
        ret
    }

    /// Physical address backing a read-only mapping of the device's
    /// shared region, if the backend exposes one.
    pub fn map_ro(&self, offset: usize, len: usize) -> AxResult<usize> {
        let guard = self.core.devref.lock();
        guard.validate()?;
        self.core.hw.ro_region(offset, len)
    }

    /// Controls whether the hardware state is kept on last close.
    pub fn set_retain_on_close(&self, retain: bool) -> AxResult {
        let guard = self.core.devref.lock();
        guard.validate()?;
        self.state.retain_on_close.store(retain, Ordering::Relaxed);
        Ok(())
    }

    /// Re-initializes every resource this device owns to its idle state.
    pub fn reset_resources(&self) -> AxResult {
        self.core.vdev_reset_resources(&self.state)
    }

    /// Closes the handle: wakes any reader blocked on it, performs the
    /// last-close hardware cleanup if applicable, and releases the parent
    /// reference (which tears the manager down if this was the last one).
    pub fn close(&self) {
        self.close_impl();
    }

    fn close_impl(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        // cancel a concurrent blocked read on this handle
        self.state.wait.notify_all();
        self.core.vdev_close(&self.state, self.holder);
    }
}

impl Drop for VdevHandle {
    fn drop(&mut self) {
        self.close_impl();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resources_bookkeeping() {
        let mut res = VdevResources::new();
        res.add(VresDesc { res_type: 0, index: 4 }).unwrap();
        res.add(VresDesc { res_type: 0, index: 2 }).unwrap();
        res.add(VresDesc { res_type: 3, index: 0 }).unwrap();

        assert_eq!(res.count_for(0), 2);
        assert_eq!(res.count_for(3), 1);
        assert_eq!(res.count_for(1), 0);

        // relative indices resolve in allocation order
        assert_eq!(res.resolve(0, 0), Some(VresDesc { res_type: 0, index: 4 }));
        assert_eq!(res.resolve(0, 1), Some(VresDesc { res_type: 0, index: 2 }));
        assert_eq!(res.resolve(0, 2), None);
        assert_eq!(res.resolve(7, 0), None);

        let all: Vec<_> = res.iter_all().collect();
        assert_eq!(all.len(), 3);
    }

    #[test]
    fn test_resources_capacity() {
        let mut res = VdevResources::new();
        for index in 0..MAX_RES_PER_VDEV {
            res.add(VresDesc { res_type: 1, index }).unwrap();
        }
        assert!(res.add(VresDesc { res_type: 1, index: 99 }).is_err());
        assert!(res.add(VresDesc { res_type: MAX_RES_TYPES, index: 0 }).is_err());
    }

    #[test]
    fn test_state_notifications_drain_before_queue() {
        let state = VdevState::new(1, ArrayString::from("a").unwrap());
        state.deliver(40, Some(b"payload"));
        state.deliver(7, None);
        state.deliver(9, None);

        // one-shot codes first, lowest first, then the queued record
        assert_eq!(state.take_one().unwrap().code(), 7);
        assert_eq!(state.take_one().unwrap().code(), 9);
        let rec = state.take_one().unwrap();
        assert_eq!(rec.code(), 40);
        assert_eq!(rec.payload(), b"payload");
        assert!(state.take_one().is_none());
        assert!(!state.has_data());
    }

    #[test]
    fn test_state_quiesce_denies_fast_path() {
        let state = VdevState::new(1, ArrayString::from("a").unwrap());
        assert!(state.gate.try_enter());
        state.gate.exit();

        state.quiesce();
        assert!(!state.gate.try_enter());
    }
}
