//! Registry of manager devices.
//!
//! Maps a small slot number (the bus layer's probe order, analogous to a
//! minor-number range) to a live [`ManagerDev`]. The registry has an
//! explicit lifecycle instead of process-wide mutable tables: the embedder
//! creates it at module init, registers each probed binding, and calls
//! [`fini`](DeviceRegistry::fini) on module exit.
//!
//! Removing a slot unbinds the device; a binding that is still held open
//! somewhere stays alive until its last handle closes (hot-unplug), but is
//! no longer reachable through the registry.

use alloc::collections::BTreeMap;
use axerrno::{ax_err, AxResult};
use spin::RwLock;

use crate::mngdev::ManagerDev;

/// Slot-indexed table of live manager devices.
pub struct DeviceRegistry {
    slots: RwLock<BTreeMap<usize, ManagerDev>>,
}

impl DeviceRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            slots: RwLock::new(BTreeMap::new()),
        }
    }

    /// Registers a device under `slot`.
    ///
    /// # Errors
    ///
    /// `AlreadyExists` if the slot is occupied.
    pub fn register(&self, slot: usize, device: ManagerDev) -> AxResult {
        let mut slots = self.slots.write();
        if slots.contains_key(&slot) {
            return ax_err!(AlreadyExists, "registry slot occupied");
        }
        debug!("registered '{}' in slot {slot}", device.name());
        slots.insert(slot, device);
        Ok(())
    }

    /// Looks up the device in `slot`.
    pub fn get(&self, slot: usize) -> Option<ManagerDev> {
        self.slots.read().get(&slot).cloned()
    }

    /// Unbinds and unregisters the device in `slot`, so no future lookup
    /// finds it.
    ///
    /// # Errors
    ///
    /// `NotFound` for an empty slot.
    pub fn remove(&self, slot: usize) -> AxResult {
        let device = match self.slots.write().remove(&slot) {
            Some(device) => device,
            None => return ax_err!(NotFound, "registry slot empty"),
        };
        device.destroy();
        Ok(())
    }

    /// Unbinds every registered device and empties the registry.
    pub fn fini(&self) {
        let devices: BTreeMap<_, _> = core::mem::take(&mut *self.slots.write());
        for (_, device) in devices {
            device.destroy();
        }
    }

    /// Number of registered devices.
    pub fn len(&self) -> usize {
        self.slots.read().len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.slots.read().is_empty()
    }
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}
