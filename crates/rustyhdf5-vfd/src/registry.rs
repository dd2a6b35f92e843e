//! Process-wide driver registry.
//!
//! The three built-in drivers are registered on first use. Further drivers
//! can be added at any time; entries are never changed or removed, so a
//! [`DriverId`] stays valid for the life of the process.

use std::fmt;
use std::sync::{Arc, OnceLock, PoisonError, RwLock};

use tracing::debug;

use crate::addr::Haddr;
use crate::core_file::CoreDriver;
use crate::error::{Result, VfdError};
use crate::family::FamilyDriver;
use crate::sec2::Sec2Driver;
use crate::vfl::Driver;

/// Stable numeric identifier of a registered driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DriverId(u32);

impl DriverId {
    pub const SEC2: Self = Self(0);
    pub const CORE: Self = Self(1);
    pub const FAMILY: Self = Self(2);

    /// The driver value.
    pub fn value(self) -> u32 {
        self.0
    }
}

impl fmt::Display for DriverId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "driver#{}", self.0)
    }
}

/// One registry entry.
#[derive(Clone)]
pub struct DriverEntry {
    pub id: DriverId,
    pub name: &'static str,
    /// Largest address the driver can serve.
    pub maxaddr: Haddr,
    /// Size of the driver's configuration payload.
    pub fapl_size: usize,
    pub driver: Arc<dyn Driver>,
}

impl fmt::Debug for DriverEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriverEntry")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("maxaddr", &self.maxaddr)
            .field("fapl_size", &self.fapl_size)
            .finish()
    }
}

/// Names that resolve to another driver.
const ALIASES: &[(&str, DriverId)] = &[("core_paged", DriverId::CORE)];

static REGISTRY: OnceLock<RwLock<Vec<DriverEntry>>> = OnceLock::new();

fn entry_for(id: DriverId, driver: Arc<dyn Driver>) -> DriverEntry {
    DriverEntry {
        id,
        name: driver.name(),
        maxaddr: driver.maxaddr(),
        fapl_size: driver.fapl_size(),
        driver,
    }
}

fn table() -> &'static RwLock<Vec<DriverEntry>> {
    REGISTRY.get_or_init(|| {
        let builtins: [Arc<dyn Driver>; 3] = [
            Arc::new(Sec2Driver),
            Arc::new(CoreDriver),
            Arc::new(FamilyDriver),
        ];
        let entries = builtins
            .into_iter()
            .enumerate()
            .map(|(i, d)| entry_for(DriverId(i as u32), d))
            .collect();
        RwLock::new(entries)
    })
}

/// Register a driver. Fails with `BadArg` if the name is taken.
pub fn register(driver: Arc<dyn Driver>) -> Result<DriverId> {
    let mut entries = table().write().unwrap_or_else(PoisonError::into_inner);
    let name = driver.name();
    if name.is_empty() {
        return Err(VfdError::BadArg("driver name is empty".into()));
    }
    if entries.iter().any(|e| e.name == name) || ALIASES.iter().any(|(a, _)| *a == name) {
        return Err(VfdError::BadArg(format!("driver '{name}' is already registered")));
    }
    let id = DriverId(entries.len() as u32);
    entries.push(entry_for(id, driver));
    debug!(name, id = id.value(), "registered driver");
    Ok(id)
}

/// The entry for `id`.
pub fn lookup(id: DriverId) -> Result<DriverEntry> {
    let entries = table().read().unwrap_or_else(PoisonError::into_inner);
    entries
        .get(id.0 as usize)
        .cloned()
        .ok_or_else(|| VfdError::BadArg(format!("{id} is not registered")))
}

/// Resolve a driver name or alias.
pub fn lookup_name(name: &str) -> Result<DriverId> {
    if let Some((_, id)) = ALIASES.iter().find(|(a, _)| *a == name) {
        return Ok(*id);
    }
    let entries = table().read().unwrap_or_else(PoisonError::into_inner);
    entries
        .iter()
        .find(|e| e.name == name)
        .map(|e| e.id)
        .ok_or_else(|| VfdError::BadArg(format!("no driver named '{name}'")))
}

/// `(id, name)` of every registered driver, in registration order.
pub fn registered() -> Vec<(DriverId, &'static str)> {
    let entries = table().read().unwrap_or_else(PoisonError::into_inner);
    entries.iter().map(|e| (e.id, e.name)).collect()
}
