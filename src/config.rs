//! Binding attributes for a manager device.

use arrayvec::ArrayString;
use axerrno::{ax_err, AxResult};

/// Maximum device name length, in bytes.
pub const MAX_NAME_LEN: usize = 31;

/// Attributes of one physical binding, fixed at creation.
#[derive(Clone, Debug)]
pub struct ManagerConfig {
    /// Name of the manager device.
    pub name: ArrayString<MAX_NAME_LEN>,
    /// Length of the mappable IO region, zero if none is available.
    pub io_size: usize,
}

impl ManagerConfig {
    /// Builds a config; fails with `InvalidInput` if the name exceeds
    /// [`MAX_NAME_LEN`] bytes.
    pub fn new(name: &str, io_size: usize) -> AxResult<Self> {
        match ArrayString::from(name) {
            Ok(name) => Ok(Self { name, io_size }),
            Err(_) => ax_err!(InvalidInput, "manager device name too long"),
        }
    }
}
