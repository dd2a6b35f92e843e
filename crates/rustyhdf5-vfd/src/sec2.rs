//! POSIX ("sec2") driver: one OS file, positional reads and writes.

use std::any::Any;
use std::cmp::Ordering;
use std::fs::{self, File, OpenOptions};
use std::io;

use tracing::debug;

use crate::addr::{addr_overflow, check_region, Haddr, MemType};
use crate::config::{AccessConfig, FileLocking};
use crate::error::{Result, VfdError};
use crate::flags::{AccessFlags, Features};
use crate::sys::{self, FileIdentity};
use crate::vfl::{Driver, NativeHandle, VirtualFile};

/// Offsets must fit a signed 64-bit file position.
const SEC2_MAXADDR: Haddr = i64::MAX as Haddr;

/// Open options for a set of access flags.
///
/// Creating needs write access even on a read-only open.
pub(crate) fn open_options(flags: AccessFlags) -> OpenOptions {
    let creat = flags.contains(AccessFlags::CREAT);
    let mut opts = OpenOptions::new();
    opts.read(true)
        .write(flags.is_writable() || creat)
        .truncate(flags.contains(AccessFlags::TRUNC));
    if creat && flags.contains(AccessFlags::EXCL) {
        opts.create_new(true);
    } else if creat {
        opts.create(true);
    }
    opts
}

/// An open sec2 file.
#[derive(Debug)]
pub struct Sec2File {
    file: File,
    name: String,
    eoa: Haddr,
    eof: Haddr,
    writable: bool,
    identity: FileIdentity,
    locking: FileLocking,
}

impl Sec2File {
    pub fn open(name: &str, flags: AccessFlags, fapl: &AccessConfig, maxaddr: Haddr) -> Result<Self> {
        if maxaddr == 0 || addr_overflow(maxaddr) {
            return Err(VfdError::BadAddr(format!("bogus maxaddr {maxaddr:#x}")));
        }
        let cannot_open = |source| VfdError::CannotOpen {
            path: name.to_owned(),
            source,
        };
        let file = open_options(flags).open(name).map_err(cannot_open)?;
        let eof = file.metadata().map_err(cannot_open)?.len();
        let identity = FileIdentity::of(&file).map_err(cannot_open)?;
        debug!(name, eof, "opened sec2 file");
        Ok(Self {
            file,
            name: name.to_owned(),
            eoa: 0,
            eof,
            writable: flags.is_writable(),
            identity,
            locking: fapl.locking,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl VirtualFile for Sec2File {
    fn driver_name(&self) -> &'static str {
        "sec2"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn features(&self) -> Features {
        Features::standard() | Features::POSIX_COMPAT_HANDLE | Features::DEFAULT_VFD_COMPATIBLE
    }

    fn compare(&self, other: &dyn VirtualFile) -> Ordering {
        match other.as_any().downcast_ref::<Sec2File>() {
            Some(other) => {
                let ord = self.identity.cmp(&other.identity);
                // No file identity here: names are all there is.
                #[cfg(not(any(unix, windows)))]
                let ord = ord.then_with(|| self.name.cmp(&other.name));
                ord
            }
            None => self.driver_name().cmp(other.driver_name()),
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
        self.eof
    }

    fn native_handle(&self, _offset: u64) -> Result<NativeHandle<'_>> {
        Ok(NativeHandle::File(&self.file))
    }

    fn read(&self, _mem_type: MemType, addr: Haddr, buf: &mut [u8]) -> Result<()> {
        let size = buf.len() as u64;
        check_region(addr, size)?;
        let n = sys::read_full_at(&self.file, buf, addr)
            .map_err(|source| VfdError::ReadError { addr, size, source })?;
        buf[n..].fill(0);
        Ok(())
    }

    fn write(&mut self, _mem_type: MemType, addr: Haddr, buf: &[u8]) -> Result<()> {
        let size = buf.len() as u64;
        if !self.writable {
            return Err(VfdError::WriteError {
                addr,
                size,
                source: io::Error::new(io::ErrorKind::PermissionDenied, "file is open read-only"),
            });
        }
        check_region(addr, size)?;
        sys::write_all_at(&self.file, buf, addr)
            .map_err(|source| VfdError::WriteError { addr, size, source })?;
        self.eof = self.eof.max(addr + size);
        Ok(())
    }

    fn truncate(&mut self) -> Result<()> {
        if self.eoa != self.eof {
            self.file
                .set_len(self.eoa)
                .map_err(|source| VfdError::SeekError {
                    context: format!("setting '{}' length to {}", self.name, self.eoa),
                    source,
                })?;
            debug!(name = %self.name, old_eof = self.eof, new_eof = self.eoa, "truncated sec2 file");
            self.eof = self.eoa;
        }
        Ok(())
    }

    fn lock(&mut self, exclusive: bool) -> Result<()> {
        sys::lock(&self.file, exclusive, self.locking)
    }

    fn unlock(&mut self) -> Result<()> {
        sys::unlock(&self.file, self.locking)
    }

    fn close(self: Box<Self>) -> Result<()> {
        debug!(name = %self.name, "closed sec2 file");
        Ok(())
    }
}

/// Registry entry for the sec2 driver.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sec2Driver;

impl Driver for Sec2Driver {
    fn name(&self) -> &'static str {
        "sec2"
    }

    fn maxaddr(&self) -> Haddr {
        SEC2_MAXADDR
    }

    fn open(
        &self,
        name: &str,
        flags: AccessFlags,
        fapl: &AccessConfig,
        maxaddr: Haddr,
    ) -> Result<Box<dyn VirtualFile>> {
        Ok(Box::new(Sec2File::open(name, flags, fapl, maxaddr)?))
    }

    fn delete(&self, name: &str, _fapl: &AccessConfig) -> Result<()> {
        fs::remove_file(name).map_err(|source| VfdError::CannotDelete {
            path: name.to_owned(),
            source,
        })
    }
}
