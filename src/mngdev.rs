//! Manager device: owner of one physical binding and its virtual devices.
//!
//! The manager composes the pieces of the multiplexing layer:
//!
//! - the [`DevRef`] guarding the binding's lifetime (its mutex doubles as
//!   the coarse lock for all administrative state),
//! - the [`ResourceManager`] arbitrating exclusive hardware sub-resources,
//! - the dispatch table fanning interrupt-context events out to each
//!   subscribed virtual device's notification set or event queue,
//! - the bounded table of virtual devices (ids 1..=31).
//!
//! # Locking
//!
//! Three independent mechanisms, by context:
//!
//! 1. The `DevRef` mutex serializes blocking-context configuration
//!    (create/destroy, allocation, lifecycle). Never taken in the
//!    interrupt-equivalent context.
//! 2. A short-hold spinlock protects the dispatch table; the
//!    interrupt-equivalent delivery path takes only this lock and the
//!    per-device notification locks, all bounded and non-suspending.
//! 3. Each virtual device's [`AccessGate`] covers the read/poll fast
//!    paths, so readers never contend with the coarse mutex and teardown
//!    can drain them deterministically.
//!
//! Subscription aggregation is recomputed from scratch on every mutation:
//! the dispatch state is copied out under the spinlock and the backend
//! hook runs outside it, under the coarse lock. Simpler and race-free
//! compared to incremental diffing.
//!
//! [`AccessGate`]: crate::gate::AccessGate

use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::Arc;
use arrayvec::ArrayString;
use axerrno::{ax_err, ax_err_type, AxError, AxResult};
use core::fmt::Write;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use spin::Mutex;

use crate::config::ManagerConfig;
use crate::dev_cell::DevCell;
use crate::devref::{DevRef, DevRefLock, HolderId};
use crate::events::{DispatchTable, EventSet, MAX_EVENT_CODES};
use crate::hw::HwSupport;
use crate::rm::{AllocMode, ResourceManager, VresDesc};
use crate::vdev::{SubscribeAction, VdevHandle, VdevState, VdevStatus, MAX_RES_PER_VDEV};

/// Highest virtual device id; ids run 1..=MAX_VDEVS.
pub const MAX_VDEVS: u8 = 31;

/// Bounded id-indexed table of virtual devices. Guarded by the coarse
/// lock; the dispatch path never walks it (subscribed devices are
/// reachable through the dispatch table instead).
struct VdevTable {
    slots: [Option<Arc<VdevState>>; MAX_VDEVS as usize + 1],
}

impl VdevTable {
    fn new() -> Self {
        Self {
            slots: [const { None }; MAX_VDEVS as usize + 1],
        }
    }

    fn get(&self, id: u8) -> Option<&Arc<VdevState>> {
        self.slots.get(id as usize).and_then(|slot| slot.as_ref())
    }

    fn by_name(&self, name: &str) -> Option<&Arc<VdevState>> {
        self.iter().find(|state| state.name.as_str() == name)
    }

    fn first_free_id(&self) -> Option<u8> {
        (1..=MAX_VDEVS).find(|&id| self.slots[id as usize].is_none())
    }

    fn insert(&mut self, state: Arc<VdevState>) {
        let slot = &mut self.slots[state.id as usize];
        // an occupied slot here means the bookkeeping invariants broke
        assert!(slot.is_none(), "virtual device table slot occupied");
        *slot = Some(state);
    }

    fn take(&mut self, id: u8) -> Option<Arc<VdevState>> {
        self.slots.get_mut(id as usize).and_then(|slot| slot.take())
    }

    fn iter(&self) -> impl Iterator<Item = &Arc<VdevState>> {
        self.slots.iter().filter_map(|slot| slot.as_ref())
    }

    fn clear_all(&mut self) {
        for slot in self.slots.iter_mut() {
            *slot = None;
        }
    }
}

struct DispatchState {
    table: DispatchTable<Arc<VdevState>>,
}

/// Shared core of one manager device.
pub(crate) struct MngCore {
    pub(crate) config: ManagerConfig,
    pub(crate) hw: Box<dyn HwSupport>,
    pub(crate) devref: DevRef,
    /// Guarded by the `devref` mutex.
    rm: DevCell<ResourceManager>,
    /// Guarded by the `devref` mutex.
    vdevs: DevCell<VdevTable>,
    /// Short-hold lock, shared with the interrupt-equivalent context.
    events: Mutex<DispatchState>,
    /// Per-event-code delivery counters.
    counters: Box<[AtomicU32]>,
    holder_seq: AtomicU64,
    torn_down: AtomicBool,
}

impl MngCore {
    /// Recomputes the subscription aggregate and forwards it to the
    /// backend. Requires the coarse lock; skipped (NotFound) once the
    /// binding is gone.
    pub(crate) fn recompute_locked(&self, guard: &DevRefLock<'_>) -> AxResult {
        let mut all = EventSet::new();
        self.events.lock().table.collect_subscribed(&mut all);
        if guard.is_valid() {
            self.hw.on_subscribe_change(&all)
        } else {
            Err(AxError::NotFound)
        }
    }

    pub(crate) fn vdev_subscribe(
        &self,
        state: &Arc<VdevState>,
        code: u16,
        action: SubscribeAction,
    ) -> AxResult {
        let guard = self.devref.lock();
        guard.validate()?;
        {
            let mut events = self.events.lock();
            match action {
                SubscribeAction::Subscribe => events.table.add(state, code)?,
                SubscribeAction::Unsubscribe => events.table.remove(state, code),
                SubscribeAction::ClearAll => events.table.remove_all(state),
            }
        }
        self.recompute_locked(&guard)
    }

    pub(crate) fn vdev_res_status(&self, state: &Arc<VdevState>, res_type: usize) -> AxResult<usize> {
        let guard = self.devref.lock();
        guard.validate()?;
        if res_type >= self.rm.get().type_count() {
            return ax_err!(InvalidInput, "unknown resource type");
        }
        Ok(state.res.get().count_for(res_type))
    }

    pub(crate) fn vdev_ioctl(
        &self,
        state: &Arc<VdevState>,
        vres: Option<(usize, usize)>,
        cmd: u32,
        arg: &mut [u8],
    ) -> AxResult<usize> {
        let guard = self.devref.lock();
        guard.validate()?;

        let mut resources: [Option<VresDesc>; 2] = [None, None];
        if let Some((res_type, rel_index)) = vres {
            let desc = state
                .res
                .get()
                .resolve(res_type, rel_index)
                .ok_or_else(|| ax_err_type!(InvalidInput, "no such allocated resource"))?;
            if self.rm.get().owner_of(desc)? != state.id {
                return ax_err!(PermissionDenied, "resource not owned by this device");
            }
            resources[0] = Some(desc);
        }
        self.hw.ioctl(Some(state.id), &resources, cmd, arg)
    }

    pub(crate) fn vdev_reset_resources(&self, state: &Arc<VdevState>) -> AxResult {
        let guard = self.devref.lock();
        guard.validate()?;
        self.init_owned_resources(&guard, state);
        Ok(())
    }

    /// Returns every resource of `state` to its idle hardware state.
    /// `_guard` witnesses that the coarse lock is held.
    fn init_owned_resources(&self, _guard: &DevRefLock<'_>, state: &VdevState) {
        for desc in state.res.get().iter_all() {
            if let Err(e) = self.hw.init_res(desc.res_type, desc.index) {
                warn!(
                    "init_res({}, {}) failed on '{}': {e:?}",
                    desc.res_type, desc.index, state.name
                );
            }
        }
    }

    pub(crate) fn vdev_close(&self, state: &Arc<VdevState>, holder: HolderId) {
        let guard = self.devref.lock();
        let previous = state.usage.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0);

        if previous == 1 {
            // Last close: return the hardware to a known idle state so
            // the next open starts fresh — unless configured to retain,
            // and only while the binding can still be programmed.
            if !state.retain_on_close.load(Ordering::Relaxed) && guard.is_valid() {
                self.init_owned_resources(&guard, state);
            }
            self.events.lock().table.remove_all(state);
            if let Err(e) = self.recompute_locked(&guard) {
                debug!("subscription recompute skipped on close: {e:?}");
            }
        }

        let remaining = guard.release(Some(holder));
        if remaining == 0 {
            info!(
                "hot-unplug: tearing down '{}' after the last close",
                self.config.name
            );
            self.destroy_now();
        }
    }

    /// Delivers one hardware-reported event. Interrupt-equivalent
    /// context: bounded work under the dispatch spinlock only.
    pub(crate) fn process_event(&self, code: u16, payload: Option<&[u8]>) {
        if let Some(counter) = self.counters.get(code as usize) {
            counter.fetch_add(1, Ordering::Relaxed);
        }
        let events = self.events.lock();
        events.table.for_subscribers(code, |state| {
            state.deliver(code, payload);
        });
    }

    /// Final teardown. Runs exactly once, after the reference was
    /// invalidated and the last holding released, so this call owns the
    /// admin state exclusively.
    pub(crate) fn destroy_now(&self) {
        let again = self.torn_down.swap(true, Ordering::AcqRel);
        assert!(!again, "manager device torn down twice");

        let vdevs = self.vdevs.get_mut();
        for state in vdevs.iter() {
            state.quiesce();
        }
        self.events.lock().table.clear();
        vdevs.clear_all();

        self.hw.end();
        info!("'{}' torn down", self.config.name);
    }
}

/// Sink handed to the backend's interrupt service routine for reporting
/// decoded hardware events.
pub struct EventSink<'a> {
    core: &'a MngCore,
}

impl EventSink<'_> {
    /// Queues a full event record to every subscriber of `code`.
    pub fn put_event(&self, code: u16, payload: &[u8]) {
        self.core.process_event(code, Some(payload));
    }

    /// Marks `code` in every subscriber's one-shot notification set.
    pub fn notify(&self, code: u16) {
        self.core.process_event(code, None);
    }
}

/// Handle on one manager device. Cheap to clone; all clones address the
/// same binding.
#[derive(Clone)]
pub struct ManagerDev {
    core: Arc<MngCore>,
}

impl ManagerDev {
    /// Binds a hardware backend: initializes it, builds the resource
    /// tables from its catalogue, and syncs the (empty) subscription
    /// aggregate.
    pub fn create(config: ManagerConfig, hw: Box<dyn HwSupport>) -> AxResult<Self> {
        hw.init()?;
        let rm = match ResourceManager::new(hw.res_defs()) {
            Ok(rm) => rm,
            Err(e) => {
                hw.end();
                return Err(e);
            }
        };
        let counters = (0..MAX_EVENT_CODES).map(|_| AtomicU32::new(0)).collect();

        let core = Arc::new(MngCore {
            config,
            hw,
            devref: DevRef::new(),
            rm: DevCell::new(rm),
            vdevs: DevCell::new(VdevTable::new()),
            events: Mutex::new(DispatchState {
                table: DispatchTable::new(),
            }),
            counters,
            holder_seq: AtomicU64::new(1),
            torn_down: AtomicBool::new(false),
        });

        // starts with no events subscribed
        if let Err(e) = core.hw.on_subscribe_change(&EventSet::new()) {
            warn!("initial subscription sync failed: {e:?}");
        }

        info!(
            "created manager device '{}' (backend '{}')",
            core.config.name,
            core.hw.name()
        );
        Ok(Self { core })
    }

    /// Name of the manager device.
    pub fn name(&self) -> &str {
        &self.core.config.name
    }

    /// Length of the mappable IO region.
    pub fn io_config(&self) -> AxResult<usize> {
        let guard = self.core.devref.lock();
        guard.validate()?;
        Ok(self.core.config.io_size)
    }

    /// Creates a virtual device. `id` of `None` picks the first free id.
    ///
    /// # Errors
    ///
    /// `AlreadyExists` if the name or the requested id is taken,
    /// `StorageFull` when all ids are in use, `InvalidInput` for an id
    /// outside 1..=[`MAX_VDEVS`] or an over-long name, `NotFound` after
    /// teardown started.
    pub fn create_vdev(&self, id: Option<u8>, name: &str) -> AxResult<u8> {
        let name: ArrayString<{ crate::config::MAX_NAME_LEN }> = ArrayString::from(name)
            .map_err(|_| ax_err_type!(InvalidInput, "virtual device name too long"))?;

        let guard = self.core.devref.lock();
        guard.validate()?;
        let vdevs = self.core.vdevs.get_mut();

        if vdevs.by_name(&name).is_some() {
            return ax_err!(AlreadyExists, "virtual device name in use");
        }
        let id = match id {
            None => match vdevs.first_free_id() {
                Some(id) => id,
                None => return ax_err!(StorageFull, "all virtual device ids in use"),
            },
            Some(id) => {
                if id == 0 || id > MAX_VDEVS {
                    return ax_err!(InvalidInput, "virtual device id out of range");
                }
                if vdevs.get(id).is_some() {
                    return ax_err!(AlreadyExists, "virtual device id in use");
                }
                id
            }
        };

        vdevs.insert(Arc::new(VdevState::new(id, name)));
        drop(guard);
        debug!("created virtual device {id} '{name}'");
        Ok(id)
    }

    /// Destroys a virtual device: cancels its readers, drops its
    /// subscriptions (recomputing the aggregate), and frees its
    /// resources. Open handles on it fail with `NotFound` afterwards.
    pub fn destroy_vdev(&self, id: u8) -> AxResult {
        let guard = self.core.devref.lock();
        guard.validate()?;
        let vdevs = self.core.vdevs.get_mut();
        let state = match vdevs.get(id) {
            Some(state) => state.clone(),
            None => return ax_err!(NotFound, "no such virtual device"),
        };

        state.quiesce();
        self.core.events.lock().table.remove_all(&state);
        if let Err(e) = self.core.recompute_locked(&guard) {
            debug!("subscription recompute skipped on destroy: {e:?}");
        }
        self.core.rm.get_mut().free_owner(id);
        *state.res.get_mut() = crate::vdev::VdevResources::new();
        vdevs.take(id);
        drop(guard);
        debug!("destroyed virtual device {id}");
        Ok(())
    }

    /// Looks a virtual device up by name.
    pub fn find_vdev(&self, name: &str) -> AxResult<Option<u8>> {
        let guard = self.core.devref.lock();
        guard.validate()?;
        Ok(self.core.vdevs.get().by_name(name).map(|state| state.id))
    }

    /// Status snapshot of a virtual device.
    pub fn vdev_status(&self, id: u8) -> AxResult<VdevStatus> {
        let guard = self.core.devref.lock();
        guard.validate()?;
        match self.core.vdevs.get().get(id) {
            Some(state) => Ok(VdevStatus {
                id: state.id,
                name: state.name,
                open_count: state.usage.load(Ordering::Relaxed),
            }),
            None => ax_err!(NotFound, "no such virtual device"),
        }
    }

    /// Allocates a resource to a virtual device. Resource sets must not
    /// change while the device is open (`PermissionDenied`).
    pub fn alloc_resource(
        &self,
        id: u8,
        resource_name: &str,
        mode: AllocMode,
        filters: &[i32],
    ) -> AxResult<VresDesc> {
        let guard = self.core.devref.lock();
        guard.validate()?;
        let state = match self.core.vdevs.get().get(id) {
            Some(state) => state.clone(),
            None => return ax_err!(NotFound, "no such virtual device"),
        };
        if state.usage.load(Ordering::Relaxed) > 0 {
            return ax_err!(PermissionDenied, "cannot change resources of an open device");
        }

        let rm = self.core.rm.get_mut();
        let res_type = rm
            .type_index(resource_name)
            .ok_or_else(|| ax_err_type!(PermissionDenied, "no such resource"))?;
        if state.res.get().count_for(res_type) >= MAX_RES_PER_VDEV {
            return ax_err!(StorageFull, "per-device resource table full");
        }

        let desc = rm.alloc(id, resource_name, mode, filters)?;
        state.res.get_mut().add(desc)?;
        drop(guard);
        debug!(
            "allocated {resource_name}[{}] (type {}) to virtual device {id}",
            desc.index, desc.res_type
        );
        Ok(desc)
    }

    /// Manager-side backend command, optionally addressing up to two
    /// resources of one virtual device by device-relative `(type, index)`.
    /// Rejected while that device is open.
    pub fn hw_ioctl(
        &self,
        vdev: Option<u8>,
        vres: [Option<(usize, usize)>; 2],
        cmd: u32,
        arg: &mut [u8],
    ) -> AxResult<usize> {
        let guard = self.core.devref.lock();
        guard.validate()?;

        let mut resources: [Option<VresDesc>; 2] = [None, None];
        if let Some(id) = vdev {
            let state = match self.core.vdevs.get().get(id) {
                Some(state) => state.clone(),
                None => return ax_err!(NotFound, "no such virtual device"),
            };
            if state.usage.load(Ordering::Relaxed) > 0 {
                return ax_err!(PermissionDenied, "cannot touch resources of an open device");
            }
            for (slot, request) in resources.iter_mut().zip(vres.iter()) {
                if let Some((res_type, rel_index)) = *request {
                    let desc = state
                        .res
                        .get()
                        .resolve(res_type, rel_index)
                        .ok_or_else(|| ax_err_type!(InvalidInput, "no such allocated resource"))?;
                    if self.core.rm.get().owner_of(desc)? != id {
                        return ax_err!(PermissionDenied, "resource not owned by target device");
                    }
                    *slot = Some(desc);
                }
            }
        } else if vres.iter().any(|r| r.is_some()) {
            return ax_err!(InvalidInput, "resource arguments require a virtual device");
        }

        self.core.hw.ioctl(vdev, &resources, cmd, arg)
    }

    /// Opens a virtual device, holding a reference on the binding for
    /// the lifetime of the returned handle.
    pub fn open_vdev(&self, id: u8) -> AxResult<VdevHandle> {
        let holder = self.core.holder_seq.fetch_add(1, Ordering::Relaxed);
        let guard = self.core.devref.acquire_locked(Some(holder))?;

        let state = match self.core.vdevs.get().get(id) {
            Some(state) => state.clone(),
            None => {
                let count = guard.release(Some(holder));
                debug_assert!(count > 0);
                return ax_err!(NotFound, "no such virtual device");
            }
        };
        state.usage.fetch_add(1, Ordering::AcqRel);
        drop(guard);
        Ok(VdevHandle::new(self.core.clone(), state, holder))
    }

    /// Queues a full event record to every subscriber of `code`.
    /// Interrupt-equivalent context.
    pub fn put_event(&self, code: u16, payload: &[u8]) {
        self.core.process_event(code, Some(payload));
    }

    /// Marks `code` in every subscriber's notification set.
    /// Interrupt-equivalent context.
    pub fn notify(&self, code: u16) {
        self.core.process_event(code, None);
    }

    /// Forwards a hardware interrupt to the backend. Returns whether the
    /// backend handled it.
    pub fn isr(&self) -> bool {
        self.core.hw.isr(&EventSink { core: &self.core })
    }

    /// How many times `code` has been delivered.
    pub fn event_count(&self, code: u16) -> u32 {
        self.core
            .counters
            .get(code as usize)
            .map_or(0, |c| c.load(Ordering::Relaxed))
    }

    /// Delivery counter dump, 16 codes per row (debugging aid).
    pub fn event_counts_info(&self) -> AxResult<String> {
        let guard = self.core.devref.lock();
        guard.validate()?;
        let mut out = String::new();
        for (code, counter) in self.core.counters.iter().enumerate() {
            if code % 16 == 0 {
                let _ = write!(out, "{code:03}: ");
            }
            let _ = write!(out, "{} ", counter.load(Ordering::Relaxed));
            if code % 16 == 15 {
                let _ = out.write_str("\n");
            }
        }
        Ok(out)
    }

    /// Resource ownership dump (debugging aid).
    pub fn alloc_info(&self) -> AxResult<String> {
        let guard = self.core.devref.lock();
        guard.validate()?;
        let mut out = String::new();
        let _ = self.core.rm.get().write_info(&mut out);
        Ok(out)
    }

    /// Hardware description plus per-resource state (debugging aid).
    pub fn hw_info(&self) -> AxResult<String> {
        let guard = self.core.devref.lock();
        guard.validate()?;

        let mut out = String::new();
        if self.core.hw.dbg_info(&mut out).is_err() {
            let _ = out.write_str("X");
        }
        let _ = out.write_str("\n");

        let rm = self.core.rm.get();
        for res_type in 0..rm.type_count() {
            let _ = writeln!(out, "{}:", rm.type_name(res_type).unwrap_or("?"));
            for index in 0..rm.count_for_type(res_type).unwrap_or(0) {
                if self.core.hw.dbg_res(&mut out, res_type, index).is_err() {
                    let _ = out.write_str("X");
                }
                let _ = out.write_str("\n");
            }
        }
        Ok(out)
    }

    /// Unbinds the physical device. New acquisitions fail immediately and
    /// blocked readers are cancelled; the binding is freed once the last
    /// outstanding handle closes (hot-unplug), or right here if none is
    /// open.
    pub fn destroy(&self) {
        let mut guard = self.core.devref.lock();
        if !guard.is_valid() {
            warn!("destroy called twice on '{}'", self.core.config.name);
            return;
        }
        guard.invalidate();
        // Fail the read/poll fast paths promptly; open handles only keep
        // the memory alive, not the device.
        for state in self.core.vdevs.get_mut().iter() {
            state.gate.deny();
            state.wait.notify_all();
        }
        drop(guard);

        // Revoke external mappings, reference unlocked around each call.
        self.core
            .devref
            .for_each_holder(|holder| self.core.hw.revoke_holder(holder));

        info!("unbinding '{}'", self.core.config.name);
        let guard = self.core.devref.lock();
        let remaining = guard.release(None);
        if remaining == 0 {
            self.core.destroy_now();
        } else {
            info!(
                "hot-unplug: {remaining} references still held, deferring teardown of '{}'",
                self.core.config.name
            );
        }
    }
}
