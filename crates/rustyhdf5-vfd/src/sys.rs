//! Thin OS layer: interrupt-safe positional I/O, advisory locks and file
//! identity.

use std::fs::File;
use std::io;

use tracing::warn;

use crate::config::FileLocking;
use crate::error::{Result, VfdError};

/// Largest single read or write handed to the OS.
#[cfg(windows)]
pub(crate) const MAX_IO_BYTES: usize = i32::MAX as usize;
#[cfg(not(windows))]
pub(crate) const MAX_IO_BYTES: usize = isize::MAX as usize;

// ---------------------------------------------------------------------------
// Positional I/O
// ---------------------------------------------------------------------------

#[cfg(unix)]
fn pread(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    std::os::unix::fs::FileExt::read_at(file, buf, offset)
}

#[cfg(unix)]
fn pwrite(file: &File, buf: &[u8], offset: u64) -> io::Result<usize> {
    std::os::unix::fs::FileExt::write_at(file, buf, offset)
}

#[cfg(windows)]
fn pread(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    std::os::windows::fs::FileExt::seek_read(file, buf, offset)
}

#[cfg(windows)]
fn pwrite(file: &File, buf: &[u8], offset: u64) -> io::Result<usize> {
    std::os::windows::fs::FileExt::seek_write(file, buf, offset)
}

// No positional calls: move the shared cursor before every request.
#[cfg(not(any(unix, windows)))]
fn pread(mut file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    use std::io::{Read, Seek, SeekFrom};
    file.seek(SeekFrom::Start(offset))?;
    file.read(buf)
}

#[cfg(not(any(unix, windows)))]
fn pwrite(mut file: &File, buf: &[u8], offset: u64) -> io::Result<usize> {
    use std::io::{Seek, SeekFrom, Write};
    file.seek(SeekFrom::Start(offset))?;
    file.write(buf)
}

/// Read into `buf` from `offset` until it is full or the file ends.
///
/// Returns the number of bytes read; the rest of `buf` is untouched.
pub(crate) fn read_full_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    let mut done = 0;
    while done < buf.len() {
        let want = (buf.len() - done).min(MAX_IO_BYTES);
        match pread(file, &mut buf[done..done + want], offset + done as u64) {
            Ok(0) => break,
            Ok(n) => done += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(done)
}

/// Write all of `buf` at `offset`.
pub(crate) fn write_all_at(file: &File, buf: &[u8], offset: u64) -> io::Result<()> {
    let mut done = 0;
    while done < buf.len() {
        let want = (buf.len() - done).min(MAX_IO_BYTES);
        match pwrite(file, &buf[done..done + want], offset + done as u64) {
            Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero)),
            Ok(n) => done += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Advisory locks
// ---------------------------------------------------------------------------

#[cfg(unix)]
fn flock(file: &File, op: libc::c_int) -> io::Result<()> {
    use std::os::unix::io::AsRawFd;
    // SAFETY: the descriptor stays open for the duration of the call.
    let rc = unsafe { libc::flock(file.as_raw_fd(), op) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(unix)]
fn lock_os(file: &File, exclusive: bool) -> io::Result<()> {
    let mode = if exclusive { libc::LOCK_EX } else { libc::LOCK_SH };
    flock(file, mode | libc::LOCK_NB)
}

#[cfg(unix)]
fn unlock_os(file: &File) -> io::Result<()> {
    flock(file, libc::LOCK_UN)
}

#[cfg(windows)]
fn lock_os(file: &File, exclusive: bool) -> io::Result<()> {
    use std::os::windows::io::AsRawHandle;
    use winapi::um::fileapi::LockFileEx;
    use winapi::um::minwinbase::{LOCKFILE_EXCLUSIVE_LOCK, LOCKFILE_FAIL_IMMEDIATELY, OVERLAPPED};
    use winapi::um::winnt::HANDLE;

    let mut flags = LOCKFILE_FAIL_IMMEDIATELY;
    if exclusive {
        flags |= LOCKFILE_EXCLUSIVE_LOCK;
    }
    // SAFETY: OVERLAPPED is plain data; zero means offset 0.
    let mut overlapped: OVERLAPPED = unsafe { std::mem::zeroed() };
    // SAFETY: the handle stays open and `overlapped` outlives the call.
    let ok = unsafe {
        LockFileEx(file.as_raw_handle() as HANDLE, flags, 0, u32::MAX, u32::MAX, &mut overlapped)
    };
    if ok == 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(windows)]
fn unlock_os(file: &File) -> io::Result<()> {
    use std::os::windows::io::AsRawHandle;
    use winapi::um::fileapi::UnlockFileEx;
    use winapi::um::minwinbase::OVERLAPPED;
    use winapi::um::winnt::HANDLE;

    // SAFETY: as in `lock_os`.
    let mut overlapped: OVERLAPPED = unsafe { std::mem::zeroed() };
    // SAFETY: the handle stays open and `overlapped` outlives the call.
    let ok = unsafe { UnlockFileEx(file.as_raw_handle() as HANDLE, 0, u32::MAX, u32::MAX, &mut overlapped) };
    if ok == 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

// No advisory locks on this platform.
#[cfg(not(any(unix, windows)))]
fn lock_os(_file: &File, _exclusive: bool) -> io::Result<()> {
    Err(io::Error::from(io::ErrorKind::Unsupported))
}

#[cfg(not(any(unix, windows)))]
fn unlock_os(_file: &File) -> io::Result<()> {
    Err(io::Error::from(io::ErrorKind::Unsupported))
}

/// Whether the OS reported that the file system has no lock support.
fn locks_unsupported(err: &io::Error) -> bool {
    #[cfg(unix)]
    if err.raw_os_error() == Some(libc::ENOSYS) {
        return true;
    }
    err.kind() == io::ErrorKind::Unsupported
}

/// Take a non-blocking advisory lock, honouring the locking policy.
pub(crate) fn lock(file: &File, exclusive: bool, policy: FileLocking) -> Result<()> {
    if policy == FileLocking::Disabled {
        return Ok(());
    }
    match lock_os(file, exclusive) {
        Ok(()) => Ok(()),
        Err(e) if policy == FileLocking::BestEffort && locks_unsupported(&e) => {
            warn!(error = %e, "file system does not support locking; continuing unlocked");
            Ok(())
        }
        Err(e) => Err(VfdError::CannotLock(e)),
    }
}

/// Drop an advisory lock, honouring the locking policy.
pub(crate) fn unlock(file: &File, policy: FileLocking) -> Result<()> {
    if policy == FileLocking::Disabled {
        return Ok(());
    }
    match unlock_os(file) {
        Ok(()) => Ok(()),
        Err(e) if policy == FileLocking::BestEffort && locks_unsupported(&e) => {
            warn!(error = %e, "file system does not support locking; ignoring unlock");
            Ok(())
        }
        Err(e) => Err(VfdError::CannotUnlock(e)),
    }
}

// ---------------------------------------------------------------------------
// File identity
// ---------------------------------------------------------------------------

/// Identity of an open file, ordered field by field.
#[cfg(unix)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FileIdentity {
    pub device: u64,
    pub inode: u64,
}

/// Identity of an open file, ordered field by field.
#[cfg(windows)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FileIdentity {
    pub volume: u32,
    pub index_high: u32,
    pub index_low: u32,
}

/// Platforms without a stable file identity: every file compares equal
/// and callers fall back to names.
#[cfg(not(any(unix, windows)))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FileIdentity;

impl FileIdentity {
    #[cfg(unix)]
    pub(crate) fn of(file: &File) -> io::Result<Self> {
        use std::os::unix::fs::MetadataExt;
        let meta = file.metadata()?;
        Ok(Self {
            device: meta.dev(),
            inode: meta.ino(),
        })
    }

    #[cfg(windows)]
    pub(crate) fn of(file: &File) -> io::Result<Self> {
        use std::os::windows::io::AsRawHandle;
        use winapi::um::fileapi::{GetFileInformationByHandle, BY_HANDLE_FILE_INFORMATION};
        use winapi::um::winnt::HANDLE;

        // SAFETY: the structure is plain data and is fully written on success.
        let mut info: BY_HANDLE_FILE_INFORMATION = unsafe { std::mem::zeroed() };
        // SAFETY: the handle stays open for the duration of the call.
        let ok = unsafe { GetFileInformationByHandle(file.as_raw_handle() as HANDLE, &mut info) };
        if ok == 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            volume: info.dwVolumeSerialNumber,
            index_high: info.nFileIndexHigh,
            index_low: info.nFileIndexLow,
        })
    }

    #[cfg(not(any(unix, windows)))]
    pub(crate) fn of(_file: &File) -> io::Result<Self> {
        Ok(Self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::OpenOptions;

    #[test]
    fn positional_round_trip_and_short_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pos.bin");
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .unwrap();

        write_all_at(&file, b"hello", 3).unwrap();
        let mut buf = [0xAAu8; 10];
        let n = read_full_at(&file, &mut buf, 0).unwrap();
        assert_eq!(n, 8);
        assert_eq!(&buf[..8], b"\0\0\0hello");
        assert_eq!(buf[8], 0xAA);
    }

    #[test]
    fn identity_follows_the_file_not_the_handle() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.bin");
        let b = dir.path().join("b.bin");
        std::fs::write(&a, b"a").unwrap();
        std::fs::write(&b, b"b").unwrap();

        let a1 = FileIdentity::of(&File::open(&a).unwrap()).unwrap();
        let a2 = FileIdentity::of(&File::open(&a).unwrap()).unwrap();
        let b1 = FileIdentity::of(&File::open(&b).unwrap()).unwrap();
        assert_eq!(a1, a2);
        #[cfg(any(unix, windows))]
        assert_ne!(a1, b1);
        let _ = b1;
    }

    #[cfg(unix)]
    #[test]
    fn second_exclusive_lock_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lock.bin");
        std::fs::write(&path, b"x").unwrap();
        let first = File::open(&path).unwrap();
        let second = File::open(&path).unwrap();

        lock(&first, true, FileLocking::Enabled).unwrap();
        let err = lock(&second, true, FileLocking::Enabled).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::CannotLock);
        lock(&second, true, FileLocking::Disabled).unwrap();

        unlock(&first, FileLocking::Enabled).unwrap();
        lock(&second, false, FileLocking::Enabled).unwrap();
    }
}
