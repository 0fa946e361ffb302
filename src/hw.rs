//! Capability interface to the hardware support backend.
//!
//! The core never touches device registers itself. Everything
//! hardware-specific — register programming, interrupt decoding, the
//! resource catalogue — lives behind [`HwSupport`], which the embedder
//! implements and hands to [`ManagerDev::create`].
//!
//! Every trait method except [`isr`] is invoked with the manager's coarse
//! lock held, so implementations may assume their calls are serialized.
//! [`isr`] runs in the interrupt-equivalent context and may only interact
//! with the core through the [`EventSink`] it is given.
//!
//! [`ManagerDev::create`]: crate::mngdev::ManagerDev::create
//! [`isr`]: HwSupport::isr
//! [`EventSink`]: crate::mngdev::EventSink

use alloc::boxed::Box;
use alloc::vec::Vec;
use axerrno::{ax_err, AxResult};

use crate::devref::HolderId;
use crate::events::EventSet;
use crate::mngdev::EventSink;
use crate::rm::VresDesc;

/// Scores how well the resource at `index` fits a pool-allocation
/// request. Inputs are the resource index and the caller's filter
/// arguments; `0` means ineligible, larger means a tighter fit.
pub type SuitsFn = Box<dyn Fn(usize, &[i32]) -> u32 + Send + Sync>;

/// One entry of the backend's resource catalogue: a named group of
/// identical, individually allocatable hardware sub-units.
pub struct ResourceDef {
    /// Name the resource is requested by (e.g. `"pulsegen"`).
    pub name: &'static str,
    /// How many units of this type exist.
    pub count: u32,
    /// Units must be reserved before use and belong to one owner at a
    /// time. All current resources are exclusive.
    pub exclusive: bool,
    /// Suitability scoring for pool allocation.
    pub suits: SuitsFn,
}

impl core::fmt::Debug for ResourceDef {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ResourceDef")
            .field("name", &self.name)
            .field("count", &self.count)
            .field("exclusive", &self.exclusive)
            .finish()
    }
}

/// The hardware support backend for one physical binding.
pub trait HwSupport: Send + Sync {
    /// Name of the backend (diagnostics only).
    fn name(&self) -> &str;

    /// Brings the hardware into a known initial state. Called once before
    /// any other method.
    fn init(&self) -> AxResult;

    /// Final shutdown. Called exactly once, after the last reference to
    /// the binding is gone and the event fast paths have drained.
    fn end(&self);

    /// The resource catalogue. Read once at manager creation.
    fn res_defs(&self) -> Vec<ResourceDef>;

    /// Applies a new subscription aggregate: the union of every virtual
    /// device's subscribed codes. The backend enables or disables its
    /// hardware event sources to match. Invoked on every subscription
    /// mutation, including the empty set at creation.
    fn on_subscribe_change(&self, subscriptions: &EventSet) -> AxResult;

    /// Returns one resource unit to its idle state. Invoked for each
    /// owned unit on a virtual device's last close.
    fn init_res(&self, res_type: usize, index: usize) -> AxResult;

    /// Hardware interrupt service. Decodes the pending condition and
    /// reports events through `sink`. Returns whether the interrupt was
    /// handled.
    fn isr(&self, sink: &EventSink<'_>) -> bool;

    /// Backend-specific command on up to two resources. The core has
    /// already verified that the named resources are owned by the target
    /// device.
    fn ioctl(
        &self,
        _vdev: Option<u8>,
        _resources: &[Option<VresDesc>; 2],
        _cmd: u32,
        _arg: &mut [u8],
    ) -> AxResult<usize> {
        ax_err!(Unsupported, "backend has no ioctl support")
    }

    /// Backend-specific command that runs without the coarse lock; only
    /// operations that cannot interfere with concurrent configuration are
    /// permitted here.
    fn direct_ioctl(&self, _cmd: u32, _arg: &mut [u8]) -> AxResult<usize> {
        ax_err!(Unsupported, "backend has no direct ioctl support")
    }

    /// Physical address of a read-only mappable region, if the backend
    /// exposes one to virtual devices.
    fn ro_region(&self, _offset: usize, _len: usize) -> AxResult<usize> {
        ax_err!(Unsupported, "backend has no mappable region")
    }

    /// Revokes any external mappings held by `holder`. Called during
    /// teardown for each registered holder identity, with the device
    /// reference unlocked.
    fn revoke_holder(&self, _holder: HolderId) {}

    /// Writes a free-form hardware description.
    fn dbg_info(&self, _out: &mut dyn core::fmt::Write) -> AxResult {
        ax_err!(Unsupported, "backend has no info support")
    }

    /// Writes the state of one resource unit.
    fn dbg_res(&self, _out: &mut dyn core::fmt::Write, _res_type: usize, _index: usize) -> AxResult {
        ax_err!(Unsupported, "backend has no per-resource info support")
    }
}
