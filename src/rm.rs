//! Resource manager: typed, exclusively owned hardware sub-resources.
//!
//! Each resource type (pulse generators, output pins, ...) is a fixed
//! table of units; a unit belongs to at most one virtual device at a
//! time. Allocation is either by fixed index, or from the pool of free
//! units ranked by the type's suitability score, so a request takes the
//! least capable unit that still satisfies it and larger units stay
//! available for requests that need them.
//!
//! The manager is not thread safe on its own; the owning controller
//! serializes access under its coarse lock.

use alloc::vec::Vec;
use arrayvec::ArrayVec;
use axerrno::{ax_err, ax_err_type, AxResult};

use crate::hw::ResourceDef;

/// Maximum number of distinct resource types, so the type tables stay
/// fixed-size.
pub const MAX_RES_TYPES: usize = 16;

/// Identifies one resource unit: its type index (position in the
/// backend's catalogue) and its absolute index within the type.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VresDesc {
    pub res_type: usize,
    pub index: usize,
}

/// How a unit is selected.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AllocMode {
    /// Exactly the unit at this index.
    Fixed(usize),
    /// Any free unit, best suitability score first.
    Pool,
}

struct TypeTable {
    def: ResourceDef,
    /// Owning virtual device id per unit, `None` when free.
    owners: Vec<Option<u8>>,
}

/// Ownership tables for the backend's whole resource catalogue.
pub struct ResourceManager {
    types: ArrayVec<TypeTable, MAX_RES_TYPES>,
}

impl ResourceManager {
    /// Builds the tables from the backend catalogue; all units start
    /// free.
    ///
    /// # Errors
    ///
    /// `StorageFull` if the catalogue has more than [`MAX_RES_TYPES`]
    /// types.
    pub fn new(defs: Vec<ResourceDef>) -> AxResult<Self> {
        if defs.len() > MAX_RES_TYPES {
            return ax_err!(StorageFull, "too many resource types");
        }
        let mut types = ArrayVec::new();
        let mut total = 0;
        for def in defs {
            total += def.count as usize;
            types.push(TypeTable {
                owners: alloc::vec![None; def.count as usize],
                def,
            });
        }
        info!("rm: {} resource types, {} resources total", types.len(), total);
        Ok(Self { types })
    }

    /// Number of resource types.
    pub fn type_count(&self) -> usize {
        self.types.len()
    }

    /// Type index for a resource name.
    pub fn type_index(&self, name: &str) -> Option<usize> {
        self.types.iter().position(|t| t.def.name == name)
    }

    /// Name of a resource type.
    pub fn type_name(&self, res_type: usize) -> Option<&str> {
        self.types.get(res_type).map(|t| t.def.name)
    }

    /// Number of units of a type.
    ///
    /// # Errors
    ///
    /// `InvalidInput` for an unknown type index.
    pub fn count_for_type(&self, res_type: usize) -> AxResult<usize> {
        self.types
            .get(res_type)
            .map(|t| t.owners.len())
            .ok_or_else(|| ax_err_type!(InvalidInput, "unknown resource type"))
    }

    /// Seizes a unit of the named type for `owner`.
    ///
    /// A fixed-index request takes the unit even from another owner (the
    /// manager may deliberately re-assign), but re-requesting a unit the
    /// same owner already has is `AddrInUse`. A pool request only
    /// considers free units, scored by the type's suitability callback
    /// with `filters`; the strictly highest positive score wins, first
    /// seen wins ties.
    ///
    /// # Errors
    ///
    /// `PermissionDenied` when nothing qualifies (unknown name, index out
    /// of range, or no suitable free unit).
    pub fn alloc(
        &mut self,
        owner: u8,
        resource_name: &str,
        mode: AllocMode,
        filters: &[i32],
    ) -> AxResult<VresDesc> {
        let mut best: Option<(usize, usize, u32)> = None;

        for (res_type, table) in self.types.iter_mut().enumerate() {
            if table.def.name != resource_name {
                continue;
            }

            match mode {
                AllocMode::Fixed(index) => {
                    let slot = match table.owners.get_mut(index) {
                        Some(slot) => slot,
                        None => continue,
                    };
                    if *slot == Some(owner) {
                        return ax_err!(AddrInUse, "resource already allocated by this owner");
                    }
                    *slot = Some(owner);
                    return Ok(VresDesc { res_type, index });
                }
                AllocMode::Pool => {
                    for (index, slot) in table.owners.iter().enumerate() {
                        if slot.is_some() {
                            continue;
                        }
                        let suitability = (table.def.suits)(index, filters);
                        if suitability == 0 {
                            continue;
                        }
                        if best.map_or(true, |(_, _, s)| suitability > s) {
                            best = Some((res_type, index, suitability));
                        }
                    }
                }
            }
        }

        match best {
            Some((res_type, index, _)) => {
                self.types[res_type].owners[index] = Some(owner);
                Ok(VresDesc { res_type, index })
            }
            None => ax_err!(PermissionDenied, "no suitable resource"),
        }
    }

    /// Frees one unit if `owner` holds it; no-op otherwise.
    pub fn release(&mut self, owner: u8, desc: VresDesc) {
        if let Some(slot) = self
            .types
            .get_mut(desc.res_type)
            .and_then(|t| t.owners.get_mut(desc.index))
        {
            if *slot == Some(owner) {
                *slot = None;
            }
        }
    }

    /// Frees every unit held by `owner`. Idempotent.
    pub fn free_owner(&mut self, owner: u8) {
        for table in self.types.iter_mut() {
            for slot in table.owners.iter_mut() {
                if *slot == Some(owner) {
                    *slot = None;
                }
            }
        }
    }

    /// Owner of a unit.
    ///
    /// # Errors
    ///
    /// `InvalidInput` for an out-of-range descriptor, `PermissionDenied`
    /// if the unit is free.
    pub fn owner_of(&self, desc: VresDesc) -> AxResult<u8> {
        let table = self
            .types
            .get(desc.res_type)
            .ok_or_else(|| ax_err_type!(InvalidInput, "unknown resource type"))?;
        let slot = table
            .owners
            .get(desc.index)
            .ok_or_else(|| ax_err_type!(InvalidInput, "resource index out of range"))?;
        slot.ok_or_else(|| ax_err_type!(PermissionDenied, "resource is free"))
    }

    /// Writes one `type name index owner` line per unit. Debugging aid.
    pub fn write_info(&self, out: &mut dyn core::fmt::Write) -> core::fmt::Result {
        for table in self.types.iter() {
            for (index, slot) in table.owners.iter().enumerate() {
                match slot {
                    Some(owner) => {
                        writeln!(out, "{} {} {} {}", table.def.name, index, "used", owner)?
                    }
                    None => writeln!(out, "{} {} {} -", table.def.name, index, "free")?,
                }
            }
        }
        Ok(())
    }
}
