//! In-memory ("core") driver.
//!
//! The whole file lives in one contiguous buffer that grows in multiples of
//! a configurable increment. With a backing store the buffer is loaded from
//! and written back to a file of the same name. With write tracking on, only
//! the pages touched since the last flush are written back.
//!
//! ```text
//!  mem  ┌───────────┬───────────┬───────────┬───────────┐
//!       │  page 0   │  page 1   │  page 2   │  page 3   │  ← eof = n × increment
//!       └───────────┴───────────┴───────────┴───────────┘
//!  dirty  [0, 8191] ───────────┘            [12288, …]     ← coalesced regions
//! ```

use std::any::Any;
use std::cmp::Ordering;
use std::fs::{self, File};
use std::io;
use std::mem;
use std::path::Path;
use std::sync::Arc;

use tracing::{debug, trace, warn};

use crate::addr::{addr_overflow, check_region, round_up, Haddr, MemType, Region};
use crate::config::{AccessConfig, FileLocking};
use crate::dirty::DirtySet;
use crate::error::{Result, VfdError};
use crate::flags::{AccessFlags, Features};
use crate::image::{ImageCallbacks, ImageOp, SystemImage};
use crate::registry::DriverId;
use crate::sec2;
use crate::sys::{self, FileIdentity};
use crate::vfl::{Driver, FileHandle, NativeHandle, VirtualFile};

/// Default buffer growth step: 1 MiB.
pub const DEFAULT_INCREMENT: usize = 1024 * 1024;
/// Default dirty-tracking page: 512 KiB.
pub const DEFAULT_PAGE_SIZE: usize = 512 * 1024;
/// Page size of the `core_paged` preset.
pub const PAGED_PAGE_SIZE: usize = 4096;

/// The buffer is indexed by `usize`.
const CORE_MAXADDR: Haddr = (usize::MAX - 1) as Haddr;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Settings for the core driver.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// Buffer growth granularity in bytes. Must be non-zero.
    pub increment: usize,
    /// Load from and write back to a file of the same name.
    pub backing_store: bool,
    /// Track dirty pages and write back only those.
    pub write_tracking: bool,
    /// Page size for write tracking. Must be non-zero when tracking.
    pub page_size: usize,
    /// Replacement buffer primitives; the global allocator when `None`.
    pub callbacks: Option<Arc<dyn ImageCallbacks>>,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            increment: DEFAULT_INCREMENT,
            backing_store: true,
            write_tracking: false,
            page_size: DEFAULT_PAGE_SIZE,
            callbacks: None,
        }
    }
}

impl CoreConfig {
    pub fn new(increment: usize, backing_store: bool) -> Self {
        Self {
            increment,
            backing_store,
            ..Self::default()
        }
    }

    /// No backing store: the file disappears when closed.
    pub fn in_memory(increment: usize) -> Self {
        Self::new(increment, false)
    }

    /// Backing store with 4 KiB dirty-page tracking.
    pub fn paged() -> Self {
        Self {
            write_tracking: true,
            page_size: PAGED_PAGE_SIZE,
            ..Self::default()
        }
    }

    pub fn with_increment(mut self, increment: usize) -> Self {
        self.increment = increment;
        self
    }

    pub fn with_backing_store(mut self, on: bool) -> Self {
        self.backing_store = on;
        self
    }

    pub fn with_write_tracking(mut self, on: bool) -> Self {
        self.write_tracking = on;
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn with_image_callbacks(mut self, callbacks: Arc<dyn ImageCallbacks>) -> Self {
        self.callbacks = Some(callbacks);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.increment == 0 {
            return Err(VfdError::BadArg("core increment must be non-zero".into()));
        }
        if self.write_tracking && self.page_size == 0 {
            return Err(VfdError::BadArg(
                "core page size must be non-zero with write tracking".into(),
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// CoreFile
// ---------------------------------------------------------------------------

/// An open core file.
#[derive(Debug)]
pub struct CoreFile {
    name: Option<String>,
    mem: Vec<u8>,
    eoa: Haddr,
    increment: u64,
    backing_store: bool,
    writable: bool,
    fd: Option<File>,
    identity: Option<FileIdentity>,
    dirty_set: Option<DirtySet>,
    callbacks: Arc<dyn ImageCallbacks>,
    dirty: bool,
    locking: FileLocking,
}

fn open_backing(name: &str, flags: AccessFlags) -> Result<File> {
    sec2::open_options(flags)
        .open(name)
        .map_err(|source| VfdError::CannotOpen {
            path: name.to_owned(),
            source,
        })
}

impl CoreFile {
    /// Open or create a named core file.
    pub fn open(name: &str, flags: AccessFlags, fapl: &AccessConfig, maxaddr: Haddr) -> Result<Self> {
        if maxaddr == 0 || addr_overflow(maxaddr) {
            return Err(VfdError::BadAddr(format!("bogus maxaddr {maxaddr:#x}")));
        }
        let config = fapl.core_config().cloned().unwrap_or_default();
        config.validate()?;

        let creating = flags.contains(AccessFlags::CREAT);
        let image = fapl.file_image.as_ref().filter(|i| !i.is_empty());

        let mut fd = None;
        if image.is_some() && !creating {
            if Path::new(name).exists() {
                return Err(VfdError::FileExists(name.to_owned()));
            }
            if config.backing_store {
                fd = Some(open_backing(name, flags | AccessFlags::CREAT)?);
            }
        } else if config.backing_store || !creating {
            fd = Some(open_backing(name, flags)?);
        }
        let identity = fd
            .as_ref()
            .map(FileIdentity::of)
            .transpose()
            .map_err(|source| VfdError::CannotOpen {
                path: name.to_owned(),
                source,
            })?;

        let mut file = Self {
            name: Some(name.to_owned()),
            mem: Vec::new(),
            eoa: 0,
            increment: config.increment as u64,
            backing_store: config.backing_store,
            writable: flags.is_writable(),
            fd,
            identity,
            dirty_set: None,
            callbacks: config.callbacks.clone().unwrap_or_else(|| Arc::new(SystemImage)),
            dirty: false,
            locking: fapl.locking,
        };

        if !creating {
            file.load(name, image.map(|i| i.as_bytes()))?;
        }

        if config.write_tracking
            && config.backing_store
            && file.writable
            && file.fd.is_some()
        {
            file.dirty_set = Some(DirtySet::new(config.page_size as u64));
        }

        debug!(
            name,
            size = file.mem.len(),
            backing_store = file.backing_store,
            write_tracking = file.dirty_set.is_some(),
            "opened core file"
        );
        Ok(file)
    }

    /// A nameless, unbacked, writable core file starting from `image`.
    pub fn anonymous(image: &[u8], config: CoreConfig) -> Result<Self> {
        config.validate()?;
        let mut file = Self {
            name: None,
            mem: Vec::new(),
            eoa: 0,
            increment: config.increment as u64,
            backing_store: false,
            writable: true,
            fd: None,
            identity: None,
            dirty_set: None,
            callbacks: config.callbacks.clone().unwrap_or_else(|| Arc::new(SystemImage)),
            dirty: false,
            locking: FileLocking::Disabled,
        };
        if !image.is_empty() {
            file.load("<image>", Some(image))?;
        }
        Ok(file)
    }

    /// Wrap an anonymous image in a VFL handle.
    pub fn open_image(image: &[u8], config: CoreConfig) -> Result<FileHandle> {
        let file = Self::anonymous(image, config)?;
        Ok(FileHandle::from_file(
            DriverId::CORE,
            Box::new(file),
            AccessFlags::RDWR,
            CORE_MAXADDR,
            FileLocking::Disabled,
        ))
    }

    /// Fill the buffer from the image or the backing file.
    fn load(&mut self, name: &str, image: Option<&[u8]>) -> Result<()> {
        let size = match (image, &self.fd) {
            (Some(bytes), _) => bytes.len() as u64,
            (None, Some(fd)) => fd
                .metadata()
                .map_err(|source| VfdError::CannotOpen {
                    path: name.to_owned(),
                    source,
                })?
                .len(),
            (None, None) => 0,
        };
        if size == 0 {
            return Ok(());
        }
        let len = usize::try_from(size).map_err(|_| VfdError::AllocFailed { size })?;
        self.mem = self
            .callbacks
            .alloc(len, ImageOp::FileOpen)
            .filter(|buf| buf.len() == len)
            .ok_or(VfdError::AllocFailed { size })?;

        match (image, &self.fd) {
            (Some(bytes), _) => self.callbacks.copy(&mut self.mem, bytes, ImageOp::FileOpen),
            (None, Some(fd)) => {
                let n = sys::read_full_at(fd, &mut self.mem, 0).map_err(|source| {
                    VfdError::ReadError {
                        addr: 0,
                        size,
                        source,
                    }
                })?;
                // The file shrank under us.
                self.mem[n..].fill(0);
            }
            (None, None) => {}
        }
        Ok(())
    }

    /// Resize the buffer to exactly `new_eof` bytes, zeroing any growth.
    /// On failure the buffer is unchanged.
    fn resize(&mut self, new_eof: u64, op: ImageOp) -> Result<()> {
        let new_len = usize::try_from(new_eof).map_err(|_| VfdError::AllocFailed { size: new_eof })?;
        let old_len = self.mem.len();
        if new_len == old_len {
            return Ok(());
        }
        if !self.callbacks.realloc(&mut self.mem, new_len, op) || self.mem.len() != new_len {
            return Err(VfdError::AllocFailed { size: new_eof });
        }
        if new_len > old_len {
            self.mem[old_len..].fill(0);
        }
        Ok(())
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// The in-memory image (length is end of file).
    pub fn as_bytes(&self) -> &[u8] {
        &self.mem
    }

    pub fn has_backing_store(&self) -> bool {
        self.backing_store && self.fd.is_some()
    }

    /// Written since the last flush.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Whether dirty pages are being tracked.
    pub fn tracks_writes(&self) -> bool {
        self.dirty_set.is_some()
    }

    /// Pending dirty regions, coalesced and in address order. Empty when
    /// writes are not tracked.
    pub fn dirty_regions(&self) -> Vec<Region> {
        self.dirty_set.as_ref().map(DirtySet::regions).unwrap_or_default()
    }
}

impl VirtualFile for CoreFile {
    fn driver_name(&self) -> &'static str {
        "core"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn features(&self) -> Features {
        let mut features = Features::standard()
            | Features::ALLOW_FILE_IMAGE
            | Features::CAN_USE_FILE_IMAGE_CALLBACKS;
        if self.has_backing_store() {
            features |= Features::POSIX_COMPAT_HANDLE | Features::DEFAULT_VFD_COMPATIBLE;
        }
        features
    }

    fn compare(&self, other: &dyn VirtualFile) -> Ordering {
        let Some(other) = other.as_any().downcast_ref::<CoreFile>() else {
            return self.driver_name().cmp(other.driver_name());
        };
        if let (Some(a), Some(b)) = (&self.identity, &other.identity) {
            return a.cmp(b);
        }
        match (&self.name, &other.name) {
            (Some(a), Some(b)) => a.cmp(b),
            (None, Some(_)) => Ordering::Less,
            (Some(_), None) => Ordering::Greater,
            (None, None) => (self as *const Self as usize).cmp(&(other as *const Self as usize)),
        }
    }

    fn eoa(&self, _mem_type: MemType) -> Haddr {
        self.eoa
    }

    fn set_eoa(&mut self, _mem_type: MemType, addr: Haddr) -> Result<()> {
        if addr_overflow(addr) {
            return Err(VfdError::AddrOverflow { addr, size: 0 });
        }
        self.eoa = addr;
        Ok(())
    }

    fn eof(&self, _mem_type: MemType) -> Haddr {
        self.mem.len() as Haddr
    }

    fn native_handle(&self, _offset: u64) -> Result<NativeHandle<'_>> {
        Ok(match &self.fd {
            Some(fd) => NativeHandle::File(fd),
            None => NativeHandle::Memory(&self.mem),
        })
    }

    fn read(&self, _mem_type: MemType, addr: Haddr, buf: &mut [u8]) -> Result<()> {
        check_region(addr, buf.len() as u64)?;
        let eof = self.mem.len() as u64;
        let avail = if addr < eof {
            (eof - addr).min(buf.len() as u64) as usize
        } else {
            0
        };
        if avail > 0 {
            let start = addr as usize;
            buf[..avail].copy_from_slice(&self.mem[start..start + avail]);
        }
        buf[avail..].fill(0);
        Ok(())
    }

    fn write(&mut self, _mem_type: MemType, addr: Haddr, buf: &[u8]) -> Result<()> {
        let size = buf.len() as u64;
        if !self.writable {
            return Err(VfdError::WriteError {
                addr,
                size,
                source: io::Error::new(io::ErrorKind::PermissionDenied, "core file is read-only"),
            });
        }
        check_region(addr, size)?;
        if buf.is_empty() {
            return Ok(());
        }

        let end = addr + size;
        let eof = self.mem.len() as u64;
        if end > eof {
            let new_eof = round_up(end, self.increment).ok_or(VfdError::AllocFailed { size: end })?;
            self.resize(new_eof, ImageOp::FileResize)?;
            trace!(old_eof = eof, new_eof, "grew core image");
        }

        if let Some(set) = &mut self.dirty_set {
            set.add(addr, end - 1, self.mem.len() as u64)?;
        }

        let start = addr as usize;
        self.mem[start..start + buf.len()].copy_from_slice(buf);
        self.dirty = true;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        let fd = match (&self.fd, self.backing_store) {
            (Some(fd), true) => fd,
            _ => {
                self.dirty = false;
                return Ok(());
            }
        };

        let eof = self.mem.len() as u64;
        match &mut self.dirty_set {
            Some(set) => {
                while let Some(region) = set.take_first() {
                    if region.start >= eof {
                        continue;
                    }
                    let end = region.end.min(eof - 1);
                    let bytes = &self.mem[region.start as usize..=end as usize];
                    if let Err(source) = sys::write_all_at(fd, bytes, region.start) {
                        // Requeue so the next flush retries the region.
                        if let Err(e) = set.add(region.start, end, eof) {
                            warn!(error = %e, start = region.start, end, "dirty region dropped");
                        }
                        return Err(VfdError::WriteError {
                            addr: region.start,
                            size: bytes.len() as u64,
                            source,
                        });
                    }
                    trace!(start = region.start, end, "flushed dirty region");
                }
            }
            None => {
                sys::write_all_at(fd, &self.mem, 0).map_err(|source| VfdError::WriteError {
                    addr: 0,
                    size: eof,
                    source,
                })?;
                trace!(size = eof, "flushed whole core image");
            }
        }
        self.dirty = false;
        Ok(())
    }

    fn truncate(&mut self) -> Result<()> {
        let new_eof = round_up(self.eoa, self.increment).ok_or(VfdError::AllocFailed { size: self.eoa })?;
        let old_eof = self.mem.len() as u64;
        if new_eof != old_eof {
            self.resize(new_eof, ImageOp::FileResize)?;
            debug!(old_eof, new_eof, "truncated core image");
        }
        Ok(())
    }

    fn truncate_on_close(&mut self) -> Result<()> {
        if !self.backing_store {
            return Ok(());
        }
        let new_eof = self.eoa;
        let old_eof = self.mem.len() as u64;
        if new_eof != old_eof {
            self.resize(new_eof, ImageOp::FileResize)?;
        }
        if let Some(fd) = &self.fd {
            let seek_err = |source| VfdError::SeekError {
                context: format!("setting backing file length to {new_eof}"),
                source,
            };
            if fd.metadata().map_err(seek_err)?.len() != new_eof {
                fd.set_len(new_eof).map_err(seek_err)?;
            }
        }
        debug!(old_eof, new_eof, "truncated core file for close");
        Ok(())
    }

    fn lock(&mut self, exclusive: bool) -> Result<()> {
        match &self.fd {
            Some(fd) => sys::lock(fd, exclusive, self.locking),
            None => Ok(()),
        }
    }

    fn unlock(&mut self) -> Result<()> {
        match &self.fd {
            Some(fd) => sys::unlock(fd, self.locking),
            None => Ok(()),
        }
    }

    fn close(mut self: Box<Self>) -> Result<()> {
        let flushed = self.flush_on_close();
        let name = self.name.take().unwrap_or_else(|| "<image>".into());
        drop(self);
        debug!(name = %name, "closed core file");
        flushed.map_err(|e| VfdError::CannotFlush {
            context: format!("closing core file '{name}'"),
            source: Box::new(e),
        })
    }
}

impl Drop for CoreFile {
    fn drop(&mut self) {
        let mem = mem::take(&mut self.mem);
        if mem.capacity() > 0 {
            self.callbacks.free(mem, ImageOp::FileClose);
        }
    }
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

/// Registry entry for the core driver.
#[derive(Debug, Clone, Copy, Default)]
pub struct CoreDriver;

impl Driver for CoreDriver {
    fn name(&self) -> &'static str {
        "core"
    }

    fn maxaddr(&self) -> Haddr {
        CORE_MAXADDR
    }

    fn fapl_size(&self) -> usize {
        mem::size_of::<CoreConfig>()
    }

    fn open(
        &self,
        name: &str,
        flags: AccessFlags,
        fapl: &AccessConfig,
        maxaddr: Haddr,
    ) -> Result<Box<dyn VirtualFile>> {
        Ok(Box::new(CoreFile::open(name, flags, fapl, maxaddr)?))
    }

    /// Removes the backing file; a file without backing store has nothing
    /// on disk.
    fn delete(&self, name: &str, fapl: &AccessConfig) -> Result<()> {
        let backing = fapl.core_config().map_or(true, |c| c.backing_store);
        if backing {
            fs::remove_file(name).map_err(|source| VfdError::CannotDelete {
                path: name.to_owned(),
                source,
            })?;
        }
        Ok(())
    }
}
