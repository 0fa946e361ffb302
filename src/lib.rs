#![no_std]

//! # Event Receiver Multiplexing
//!
//! This crate virtualizes a single hardware event/timing receiver into
//! multiple independently owned virtual sub-devices, each with its own
//! resource allocation, event subscriptions, and lifecycle. Register-level
//! programming stays behind a pluggable backend; the crate owns the
//! concurrency-safe multiplexing layer in between.
//!
//! ## Architecture
//!
//! Leaf to root:
//!
//! - [`EventSet`]: fixed bitmap over the event code space
//! - [`DispatchTable`]: per-event-code bounded subscriber lists
//! - [`EventQueue`]: per-device SPSC ring of event records, overflow-safe
//! - [`ResourceManager`]: exclusive, suitability-scored resource tables
//! - [`DevRef`]: validity + lock + counted holders, safe under hot-unplug
//! - [`ManagerDev`]: owns one physical binding and its virtual devices
//! - [`VdevHandle`]: open handle on one virtual device (read/poll/subscribe)
//!
//! ## Execution contexts
//!
//! Blocking-context configuration (create, allocate, subscribe) serializes
//! on the device reference mutex. The backend reports hardware events from
//! an interrupt-equivalent context that only ever takes short-hold
//! spinlocks and pushes into per-device queues; blocked readers wake
//! through a spin/yield wait queue. A third, lock-free gate keeps the
//! read/poll fast paths clear of the coarse mutex and lets teardown drain
//! them before anything is freed.
//!
//! ## Example
//!
//! ```rust,ignore
//! use evrmux::{AllocMode, ManagerConfig, ManagerDev, SubscribeAction};
//!
//! let mng = ManagerDev::create(ManagerConfig::new("evr0", 0x8000)?, backend)?;
//! let id = mng.create_vdev(None, "beamline-a")?;
//! mng.alloc_resource(id, "pulsegen", AllocMode::Pool, &[16, 32, 32])?;
//!
//! let dev = mng.open_vdev(id)?;
//! dev.subscribe(0x1c, SubscribeAction::Subscribe)?;
//! for record in dev.read(256)? {
//!     /* record.code(), record.payload() */
//! }
//! ```

extern crate alloc;
#[macro_use]
extern crate log;

mod config;
mod dev_cell;
mod devref;
mod events;
mod gate;
mod hw;
mod mngdev;
mod queue;
mod registry;
mod rm;
mod vdev;

pub use config::{ManagerConfig, MAX_NAME_LEN};
pub use dev_cell::DevCell;
pub use devref::{DevRef, DevRefLock, HolderId};
pub use events::{DispatchTable, EventSet, MAX_EVENT_CODES, MAX_SUBSCRIBERS};
pub use gate::{AccessGate, WaitQueue};
pub use hw::{HwSupport, ResourceDef, SuitsFn};
pub use mngdev::{EventSink, ManagerDev, MAX_VDEVS};
pub use queue::{EventQueue, EventRecord, EVENT_OVERFLOW, MAX_PAYLOAD, QUEUE_CAPACITY};
pub use registry::DeviceRegistry;
pub use rm::{AllocMode, ResourceManager, VresDesc, MAX_RES_TYPES};
pub use vdev::{SubscribeAction, VdevHandle, VdevStatus, MAX_RES_PER_VDEV};
