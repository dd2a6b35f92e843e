//! Virtual File Layer: the driver contract and the handle the rest of the
//! library holds.
//!
//! ```text
//! ┌───────────────────────────┐
//! │  FileHandle (base_addr,   │  ← address translation, state, locking
//! │  maxaddr, state)          │
//! ├───────────────────────────┤
//! │  dyn VirtualFile          │  ← trait defined here
//! ├────────┬────────┬─────────┤
//! │  sec2  │  core  │ family  │  ← drivers
//! └────────┴────────┴─────────┘
//! ```
//!
//! Drivers are looked up through the [`registry`](crate::registry) by the
//! [`DriverId`] in an [`AccessConfig`]. Optional operations have default
//! implementations, so a driver only overrides what it supports.

use std::any::Any;
use std::cmp::Ordering;
use std::fmt;
use std::fs::File;

use tracing::{debug, trace};

use crate::addr::{addr_overflow, check_region, Haddr, MemType, UNDEF};
use crate::config::{AccessConfig, FileLocking};
use crate::error::{Result, VfdError};
use crate::flags::{AccessFlags, CtlFlags, Features};
use crate::registry::{self, DriverId};

/// A borrowed, non-owning view of what a driver stores its bytes in.
///
/// Valid only while the handle it came from is open.
#[derive(Debug, Clone, Copy)]
pub enum NativeHandle<'a> {
    /// An OS file (use `AsRawFd`/`AsRawHandle` for the descriptor).
    File(&'a File),
    /// The in-memory image of an unbacked core file.
    Memory(&'a [u8]),
}

/// A driver-specific request passed through [`VirtualFile::ctl`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CtlOp {
    pub code: u64,
    pub flags: CtlFlags,
}

impl CtlOp {
    pub fn new(code: u64, flags: CtlFlags) -> Self {
        Self { code, flags }
    }
}

/// Driver record stored in the file's boot block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverInfo {
    /// Eight-byte tag naming the driver that wrote the record.
    pub name: [u8; 8],
    pub data: Vec<u8>,
}

/// Unknown `ctl` op: fail only when the caller asked for that.
pub fn unknown_ctl(driver: &str, op: CtlOp) -> Result<Vec<u8>> {
    if op.flags.contains(CtlFlags::FAIL_IF_UNKNOWN) {
        return Err(VfdError::Unsupported(format!(
            "{driver}: unknown ctl op code {:#x}",
            op.code
        )));
    }
    Ok(Vec::new())
}

/// An open file as seen by one driver.
///
/// Addresses passed in are absolute in the driver's address space; the
/// [`FileHandle`] applies the base address before calling in.
pub trait VirtualFile: fmt::Debug + Send {
    /// Name of the driver that owns this file.
    fn driver_name(&self) -> &'static str;

    fn as_any(&self) -> &dyn Any;

    /// Capability bits.
    fn features(&self) -> Features;

    /// Identity order against another file of the same driver.
    fn compare(&self, other: &dyn VirtualFile) -> Ordering;

    /// End of allocated address space.
    fn eoa(&self, mem_type: MemType) -> Haddr;

    fn set_eoa(&mut self, mem_type: MemType, addr: Haddr) -> Result<()>;

    /// End of materialised bytes.
    fn eof(&self, mem_type: MemType) -> Haddr;

    /// Borrow the underlying storage. `offset` selects a member in drivers
    /// that have several.
    fn native_handle(&self, _offset: u64) -> Result<NativeHandle<'_>> {
        Err(VfdError::Unsupported(format!(
            "{}: native handle not available",
            self.driver_name()
        )))
    }

    /// Fill `buf` from `addr`. Bytes past end of file read as zero.
    fn read(&self, mem_type: MemType, addr: Haddr, buf: &mut [u8]) -> Result<()>;

    /// Store `buf` at `addr`, extending end of file if needed.
    fn write(&mut self, mem_type: MemType, addr: Haddr, buf: &[u8]) -> Result<()>;

    /// Make every accepted write durable. A clean file does nothing.
    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    /// Flush as part of closing.
    fn flush_on_close(&mut self) -> Result<()> {
        self.flush()
    }

    /// Checkpoint truncate: resize the physical file towards `eoa`.
    fn truncate(&mut self) -> Result<()> {
        Ok(())
    }

    /// Close-time truncate: set the physical size to exactly `eoa`.
    fn truncate_on_close(&mut self) -> Result<()> {
        self.truncate()
    }

    /// Take a non-blocking advisory lock.
    fn lock(&mut self, _exclusive: bool) -> Result<()> {
        Ok(())
    }

    fn unlock(&mut self) -> Result<()> {
        Ok(())
    }

    /// Drain buffers and release every resource.
    fn close(self: Box<Self>) -> Result<()>;

    /// Driver-specific escape hatch.
    fn ctl(&mut self, op: CtlOp, _input: &[u8]) -> Result<Vec<u8>> {
        unknown_ctl(self.driver_name(), op)
    }

    /// Bytes of driver information this file contributes to the boot block.
    fn sb_size(&self) -> usize {
        0
    }

    fn sb_encode(&self) -> Result<Option<DriverInfo>> {
        Ok(None)
    }

    fn sb_decode(&mut self, _info: &DriverInfo) -> Result<()> {
        Ok(())
    }
}

/// A file driver: opens and deletes files of one kind.
pub trait Driver: Send + Sync {
    /// Unique registry name.
    fn name(&self) -> &'static str;

    /// Largest address the driver can serve.
    fn maxaddr(&self) -> Haddr;

    /// Size of the driver's configuration payload.
    fn fapl_size(&self) -> usize {
        0
    }

    fn open(
        &self,
        name: &str,
        flags: AccessFlags,
        fapl: &AccessConfig,
        maxaddr: Haddr,
    ) -> Result<Box<dyn VirtualFile>>;

    /// Remove the file (or files) behind `name`.
    fn delete(&self, name: &str, fapl: &AccessConfig) -> Result<()>;
}

/// Lifecycle of an open handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    /// Opened, nothing written or flushed yet.
    Open,
    /// Written since the last flush.
    Dirty,
    /// Flushed with no writes since.
    Clean,
}

// ---------------------------------------------------------------------------
// FileHandle
// ---------------------------------------------------------------------------

/// The handle the library holds for an open file.
///
/// Every address passed in is relative to [`base_addr`](Self::base_addr).
/// Closing consumes the handle, so a file cannot be closed twice.
#[derive(Debug)]
pub struct FileHandle {
    driver: DriverId,
    file: Box<dyn VirtualFile>,
    flags: AccessFlags,
    base_addr: Haddr,
    maxaddr: Haddr,
    locking: FileLocking,
    state: HandleState,
    eoa_set: bool,
}

impl FileHandle {
    /// Open `name` with the driver selected by `fapl`.
    ///
    /// `maxaddr` of [`UNDEF`] means the driver's own limit.
    pub fn open(name: &str, flags: AccessFlags, fapl: &AccessConfig, maxaddr: Haddr) -> Result<Self> {
        if name.is_empty() {
            return Err(VfdError::BadArg("file name is empty".into()));
        }
        let entry = registry::lookup(fapl.driver)?;
        if maxaddr == 0 {
            return Err(VfdError::BadAddr("maxaddr is zero".into()));
        }
        let maxaddr = if maxaddr == UNDEF { entry.maxaddr } else { maxaddr };
        if addr_overflow(maxaddr) || maxaddr > entry.maxaddr {
            return Err(VfdError::BadAddr(format!(
                "maxaddr {maxaddr:#x} exceeds the {} driver limit {:#x}",
                entry.name, entry.maxaddr
            )));
        }

        let file = entry.driver.open(name, flags, fapl, maxaddr)?;
        debug!(driver = entry.name, name, ?flags, maxaddr, "opened file");
        Ok(Self::from_file(fapl.driver, file, flags, maxaddr, fapl.locking))
    }

    /// Open `name` with no caller configuration: the driver, its settings
    /// and the locking policy come from `HDF5_DRIVER`,
    /// `HDF5_DRIVER_CONFIG` and `HDF5_USE_FILE_LOCKING`.
    pub fn open_from_env(name: &str, flags: AccessFlags, maxaddr: Haddr) -> Result<Self> {
        let fapl = AccessConfig::from_env()?;
        Self::open(name, flags, &fapl, maxaddr)
    }

    /// Wrap a file a driver opened directly.
    pub fn from_file(
        driver: DriverId,
        file: Box<dyn VirtualFile>,
        flags: AccessFlags,
        maxaddr: Haddr,
        locking: FileLocking,
    ) -> Self {
        Self {
            driver,
            file,
            flags,
            base_addr: 0,
            maxaddr,
            locking,
            state: HandleState::Open,
            eoa_set: false,
        }
    }

    /// Remove `name` with the driver selected by `fapl`.
    pub fn delete(name: &str, fapl: &AccessConfig) -> Result<()> {
        if name.is_empty() {
            return Err(VfdError::BadArg("file name is empty".into()));
        }
        let entry = registry::lookup(fapl.driver)?;
        entry.driver.delete(name, fapl)?;
        debug!(driver = entry.name, name, "deleted file");
        Ok(())
    }

    pub fn driver_id(&self) -> DriverId {
        self.driver
    }

    pub fn driver_name(&self) -> &'static str {
        self.file.driver_name()
    }

    pub fn flags(&self) -> AccessFlags {
        self.flags
    }

    pub fn features(&self) -> Features {
        self.file.features()
    }

    pub fn state(&self) -> HandleState {
        self.state
    }

    pub fn base_addr(&self) -> Haddr {
        self.base_addr
    }

    /// Offset every later address by `base_addr`.
    pub fn set_base_addr(&mut self, base_addr: Haddr) -> Result<()> {
        if addr_overflow(base_addr) || base_addr > self.maxaddr {
            return Err(VfdError::BadAddr(format!("base address {base_addr:#x} out of range")));
        }
        self.base_addr = base_addr;
        Ok(())
    }

    pub fn maxaddr(&self) -> Haddr {
        self.maxaddr
    }

    /// The driver-level file, for downcasting to a concrete driver type.
    pub fn inner(&self) -> &dyn VirtualFile {
        self.file.as_ref()
    }

    /// The concrete driver file, if it is a `T`.
    pub fn downcast_ref<T: VirtualFile + 'static>(&self) -> Option<&T> {
        self.file.as_any().downcast_ref::<T>()
    }

    fn absolute(&self, addr: Haddr, size: u64) -> Result<Haddr> {
        let abs = addr
            .checked_add(self.base_addr)
            .ok_or(VfdError::AddrOverflow { addr, size })?;
        check_region(abs, size)?;
        Ok(abs)
    }

    /// End of allocated address space, relative to the base address.
    pub fn eoa(&self, mem_type: MemType) -> Haddr {
        self.file.eoa(mem_type).saturating_sub(self.base_addr)
    }

    /// Set the end of allocated address space.
    pub fn set_eoa(&mut self, mem_type: MemType, addr: Haddr) -> Result<()> {
        let abs = self.absolute(addr, 0)?;
        if abs > self.maxaddr {
            return Err(VfdError::AddrOverflow { addr, size: 0 });
        }
        self.file.set_eoa(mem_type, abs)?;
        self.eoa_set = true;
        trace!(driver = self.driver_name(), eoa = abs, "set eoa");
        Ok(())
    }

    /// The larger of the materialised end and the allocated end, relative
    /// to the base address.
    pub fn eof(&self, mem_type: MemType) -> Haddr {
        let end = self.file.eof(mem_type).max(self.file.eoa(mem_type));
        end.saturating_sub(self.base_addr)
    }

    pub fn read(&self, mem_type: MemType, addr: Haddr, buf: &mut [u8]) -> Result<()> {
        let abs = self.absolute(addr, buf.len() as u64)?;
        trace!(driver = self.driver_name(), addr = abs, size = buf.len(), "read");
        self.file.read(mem_type, abs, buf)
    }

    pub fn write(&mut self, mem_type: MemType, addr: Haddr, buf: &[u8]) -> Result<()> {
        let abs = self.absolute(addr, buf.len() as u64)?;
        trace!(driver = self.driver_name(), addr = abs, size = buf.len(), "write");
        self.file.write(mem_type, abs, buf)?;
        self.state = HandleState::Dirty;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.file.flush()?;
        self.state = HandleState::Clean;
        Ok(())
    }

    /// Checkpoint truncate.
    pub fn truncate(&mut self) -> Result<()> {
        self.file.truncate()
    }

    /// Close-time truncate without closing.
    pub fn truncate_on_close(&mut self) -> Result<()> {
        self.file.truncate_on_close()
    }

    /// Advisory lock; a no-op when locking is disabled.
    pub fn lock(&mut self, exclusive: bool) -> Result<()> {
        if self.locking == FileLocking::Disabled {
            return Ok(());
        }
        self.file.lock(exclusive)
    }

    pub fn unlock(&mut self) -> Result<()> {
        if self.locking == FileLocking::Disabled {
            return Ok(());
        }
        self.file.unlock()
    }

    pub fn native_handle(&self, offset: u64) -> Result<NativeHandle<'_>> {
        self.file.native_handle(offset)
    }

    pub fn ctl(&mut self, op: CtlOp, input: &[u8]) -> Result<Vec<u8>> {
        self.file.ctl(op, input)
    }

    pub fn sb_size(&self) -> usize {
        self.file.sb_size()
    }

    pub fn sb_encode(&self) -> Result<Option<DriverInfo>> {
        self.file.sb_encode()
    }

    pub fn sb_decode(&mut self, info: &DriverInfo) -> Result<()> {
        self.file.sb_decode(info)
    }

    /// Identity order: by driver first, then by the driver's own rule.
    pub fn compare(&self, other: &FileHandle) -> Ordering {
        self.driver
            .cmp(&other.driver)
            .then_with(|| self.file.compare(other.file.as_ref()))
    }

    /// Close the file.
    ///
    /// When this handle has set the end of allocated space on a writable
    /// file, the physical size is first cut to exactly that address. The
    /// driver then drains its buffers and releases everything.
    pub fn close(mut self) -> Result<()> {
        let name = self.driver_name();
        let truncated = if self.eoa_set && self.flags.is_writable() {
            self.file.truncate_on_close()
        } else {
            Ok(())
        };
        let closed = self.file.close();
        debug!(driver = name, "closed file");
        truncated.and(closed)
    }
}
