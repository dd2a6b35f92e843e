//! Family driver: one logical address space over a numbered sequence of
//! fixed-size member files.
//!
//! ```text
//!  logical  0 ─────────── memb_size ─────────── 2·memb_size ──────── eoa
//!           │  member 0   │  member 1           │  member 2  │
//!           │ fam-000000  │ fam-000001          │ fam-000002 │
//! ```
//!
//! Address `a` lives in member `a / memb_size` at offset `a % memb_size`.
//! Members are opened through the VFL with their own access configuration
//! (sec2 by default) and are created on demand as the file grows.

use std::any::Any;
use std::cmp::Ordering;
use std::fmt;
use std::io;
use std::mem;
use std::path::Path;

use byteorder::{ByteOrder, LittleEndian};
use tracing::{debug, trace, warn};

use crate::addr::{addr_overflow, check_region, Haddr, MemType, MAX_ADDR, UNDEF};
use crate::config::AccessConfig;
use crate::error::{Result, VfdError};
use crate::flags::{AccessFlags, CtlFlags, Features};
use crate::template::MemberTemplate;
use crate::vfl::{unknown_ctl, CtlOp, Driver, DriverInfo, FileHandle, NativeHandle, VirtualFile};

/// Member size meaning "take it from the files on disk".
pub const FAMILY_DEFAULT: u64 = 0;
/// Member size used when nothing else decides: 100 MiB.
pub const DEFAULT_MEMB_SIZE: u64 = 100 * 1024 * 1024;

/// Tag of the boot-block record.
const SB_TAG: [u8; 8] = *b"NCSAfami";
/// Payload of the boot-block record: the member size.
const SB_SIZE: usize = 8;
/// Smallest member-slot allocation.
const MIN_MEMBER_SLOTS: usize = 64;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Settings for the family driver.
#[derive(Debug, Clone)]
pub struct FamilyConfig {
    /// Logical size of each member, or [`FAMILY_DEFAULT`].
    pub memb_size: u64,
    /// Access configuration used to open every member.
    pub member: Box<AccessConfig>,
    /// Rewrite the stored member size to this value on open.
    pub repartition: Option<u64>,
}

impl Default for FamilyConfig {
    fn default() -> Self {
        Self::new(DEFAULT_MEMB_SIZE)
    }
}

impl FamilyConfig {
    /// Members of `memb_size` bytes, opened with sec2.
    pub fn new(memb_size: u64) -> Self {
        Self {
            memb_size,
            member: Box::new(AccessConfig::sec2()),
            repartition: None,
        }
    }

    pub fn with_member_access(mut self, member: AccessConfig) -> Self {
        self.member = Box::new(member);
        self
    }

    /// Accept whatever member size is stored and replace it with
    /// `new_size`. Used by tools that re-split a family.
    pub fn with_repartition(mut self, new_size: u64) -> Self {
        self.repartition = Some(new_size);
        self
    }
}

// ---------------------------------------------------------------------------
// Address mapping
// ---------------------------------------------------------------------------

/// One piece of a logical request, confined to a single member.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemberIo {
    /// Member index.
    pub member: u64,
    /// Offset within the member.
    pub offset: u64,
    /// Offset within the caller's buffer.
    pub buf_offset: usize,
    pub len: usize,
}

impl fmt::Display for MemberIo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "MemberIo(member={}, offset={}, len={})",
            self.member, self.offset, self.len
        )
    }
}

/// Split `[addr, addr + len)` into per-member pieces.
pub fn map_range(memb_size: u64, addr: Haddr, len: usize) -> Vec<MemberIo> {
    debug_assert!(memb_size > 0);
    let mut ops = Vec::new();
    let mut addr = addr;
    let mut done = 0usize;
    while done < len {
        let member = addr / memb_size;
        let offset = addr % memb_size;
        let chunk = (memb_size - offset).min((len - done) as u64) as usize;
        ops.push(MemberIo {
            member,
            offset,
            buf_offset: done,
            len: chunk,
        });
        addr += chunk as u64;
        done += chunk;
    }
    ops
}

fn slot(member: u64) -> Result<usize> {
    usize::try_from(member).map_err(|_| VfdError::AddrOverflow {
        addr: member,
        size: 0,
    })
}

/// The member template for `name`. A plain name gets the default
/// conversion; with `reject_existing`, a plain name that is already a file
/// is refused.
fn resolve_template(name: &str, reject_existing: bool) -> Result<MemberTemplate> {
    let template = match MemberTemplate::parse(name)? {
        Some(t) => t,
        None => {
            if reject_existing && Path::new(name).exists() {
                return Err(VfdError::FileExists(name.to_owned()));
            }
            let text = MemberTemplate::default_for(name);
            debug!(name, template = %text, "plain family name, using default template");
            MemberTemplate::parse(&text)?
                .ok_or_else(|| VfdError::BadArg(format!("no member template for '{name}'")))?
        }
    };
    if template.expand(0) == template.expand(1) {
        return Err(VfdError::BadArg(format!(
            "member template '{template}' gives the same name for every member"
        )));
    }
    Ok(template)
}

// ---------------------------------------------------------------------------
// FamilyFile
// ---------------------------------------------------------------------------

/// An open family of member files.
#[derive(Debug)]
pub struct FamilyFile {
    template: MemberTemplate,
    memb_size: u64,
    /// Member size from the access configuration; recorded in the boot block.
    pmem_size: u64,
    mem_newsize: Option<u64>,
    members: Vec<FileHandle>,
    member_fapl: AccessConfig,
    flags: AccessFlags,
    eoa: Haddr,
}

impl FamilyFile {
    pub fn open(name: &str, flags: AccessFlags, fapl: &AccessConfig, maxaddr: Haddr) -> Result<Self> {
        if maxaddr == 0 || addr_overflow(maxaddr) {
            return Err(VfdError::BadAddr(format!("bogus maxaddr {maxaddr:#x}")));
        }
        let config = fapl.family_config().cloned().unwrap_or_default();
        let template = resolve_template(name, true)?;
        let mut member_fapl = *config.member;
        member_fapl.locking = fapl.locking;

        let mut file = Self {
            template,
            memb_size: config.memb_size,
            pmem_size: config.memb_size,
            mem_newsize: config.repartition,
            members: Vec::new(),
            member_fapl,
            flags,
            eoa: 0,
        };

        loop {
            let idx = file.members.len();
            let member_name = file.template.expand(idx);
            let member_flags = if idx == 0 { flags } else { flags.without_create() };
            match FileHandle::open(&member_name, member_flags, &file.member_fapl, UNDEF) {
                Ok(handle) => {
                    file.push_member(handle);
                    debug!(member = idx, name = %member_name, "opened family member");
                }
                Err(e) if idx == 0 => return Err(e),
                Err(e) => {
                    trace!(member = idx, error = %e, "no further family members");
                    break;
                }
            }
        }

        let eof0 = file.members[0].inner().eof(MemType::Default);
        if eof0 > 0
            && (file.memb_size == FAMILY_DEFAULT || file.members.len() > 1 || eof0 > file.memb_size)
        {
            if file.memb_size != FAMILY_DEFAULT && file.memb_size != eof0 {
                debug!(configured = file.memb_size, adopted = eof0, "member size taken from first member");
            }
            file.memb_size = eof0;
        }
        if file.memb_size == FAMILY_DEFAULT {
            file.memb_size = DEFAULT_MEMB_SIZE;
        }

        debug!(
            name,
            template = %file.template,
            members = file.members.len(),
            memb_size = file.memb_size,
            "opened family file"
        );
        Ok(file)
    }

    /// Number of members currently open.
    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    /// Logical size of each member.
    pub fn member_size(&self) -> u64 {
        self.memb_size
    }

    pub fn member_template(&self) -> &MemberTemplate {
        &self.template
    }

    /// A member handle.
    pub fn member(&self, index: usize) -> Option<&FileHandle> {
        self.members.get(index)
    }

    /// Append a member, growing the slot array by doubling.
    fn push_member(&mut self, handle: FileHandle) {
        if self.members.len() == self.members.capacity() {
            let target = (self.members.capacity() * 2).max(MIN_MEMBER_SLOTS);
            self.members.reserve_exact(target - self.members.len());
        }
        self.members.push(handle);
    }

    /// Create members up to and including `index`.
    fn ensure_member(&mut self, index: usize) -> Result<()> {
        while self.members.len() <= index {
            let idx = self.members.len();
            let member_name = self.template.expand(idx);
            let handle = FileHandle::open(
                &member_name,
                self.flags | AccessFlags::CREAT,
                &self.member_fapl,
                self.memb_size,
            )?;
            self.push_member(handle);
            debug!(member = idx, name = %member_name, "created family member");
        }
        Ok(())
    }

    /// Size written to the boot block.
    fn stored_size(&self) -> u64 {
        if self.pmem_size == FAMILY_DEFAULT {
            self.memb_size
        } else {
            self.pmem_size
        }
    }
}

impl VirtualFile for FamilyFile {
    fn driver_name(&self) -> &'static str {
        "family"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn features(&self) -> Features {
        let mut features = Features::standard();
        if self.mem_newsize.is_some() {
            features |= Features::DIRTY_DRVRINFO_LOAD;
        }
        features
    }

    fn compare(&self, other: &dyn VirtualFile) -> Ordering {
        match other.as_any().downcast_ref::<FamilyFile>() {
            Some(other) => match (self.members.first(), other.members.first()) {
                (Some(a), Some(b)) => a.compare(b),
                (a, b) => a.is_some().cmp(&b.is_some()),
            },
            None => self.driver_name().cmp(other.driver_name()),
        }
    }

    fn eoa(&self, _mem_type: MemType) -> Haddr {
        self.eoa
    }

    fn set_eoa(&mut self, mem_type: MemType, addr: Haddr) -> Result<()> {
        if addr_overflow(addr) {
            return Err(VfdError::AddrOverflow { addr, size: 0 });
        }
        let mut remaining = addr;
        let mut idx = 0;
        while remaining > 0 || idx < self.members.len() {
            self.ensure_member(idx)?;
            let local = remaining.min(self.memb_size);
            self.members[idx].set_eoa(mem_type, local)?;
            remaining -= local;
            idx += 1;
        }
        self.eoa = addr;
        Ok(())
    }

    fn eof(&self, mem_type: MemType) -> Haddr {
        self.members
            .iter()
            .enumerate()
            .rev()
            .map(|(i, m)| (i as u64, m.inner().eof(mem_type)))
            .find(|&(_, eof)| eof > 0)
            .map_or(0, |(i, eof)| i.saturating_mul(self.memb_size).saturating_add(eof))
    }

    fn native_handle(&self, offset: u64) -> Result<NativeHandle<'_>> {
        let idx = slot(offset / self.memb_size)?;
        let member = self.members.get(idx).ok_or_else(|| {
            VfdError::BadArg(format!("offset {offset:#x} is past the last family member"))
        })?;
        member.native_handle(offset % self.memb_size)
    }

    fn read(&self, mem_type: MemType, addr: Haddr, buf: &mut [u8]) -> Result<()> {
        check_region(addr, buf.len() as u64)?;
        for io in map_range(self.memb_size, addr, buf.len()) {
            let dst = &mut buf[io.buf_offset..io.buf_offset + io.len];
            match self.members.get(slot(io.member)?) {
                Some(member) => member.read(mem_type, io.offset, dst)?,
                None => dst.fill(0),
            }
        }
        Ok(())
    }

    fn write(&mut self, mem_type: MemType, addr: Haddr, buf: &[u8]) -> Result<()> {
        let size = buf.len() as u64;
        if !self.flags.is_writable() {
            return Err(VfdError::WriteError {
                addr,
                size,
                source: io::Error::new(io::ErrorKind::PermissionDenied, "family is open read-only"),
            });
        }
        check_region(addr, size)?;
        for io in map_range(self.memb_size, addr, buf.len()) {
            let idx = slot(io.member)?;
            self.ensure_member(idx)?;
            trace!(%io, "family write");
            self.members[idx].write(mem_type, io.offset, &buf[io.buf_offset..io.buf_offset + io.len])?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        let mut first = None;
        for (i, member) in self.members.iter_mut().enumerate() {
            if let Err(e) = member.flush() {
                if first.is_none() {
                    first = Some((i, e));
                } else {
                    warn!(member = i, error = %e, "family member flush failed");
                }
            }
        }
        match first {
            Some((i, e)) => Err(VfdError::CannotFlush {
                context: format!("family member {i}"),
                source: Box::new(e),
            }),
            None => Ok(()),
        }
    }

    fn truncate(&mut self) -> Result<()> {
        broadcast(&mut self.members, "truncate", FileHandle::truncate)
    }

    fn truncate_on_close(&mut self) -> Result<()> {
        broadcast(&mut self.members, "truncate", FileHandle::truncate_on_close)
    }

    fn lock(&mut self, exclusive: bool) -> Result<()> {
        for i in 0..self.members.len() {
            if let Err(e) = self.members[i].lock(exclusive) {
                for (j, locked) in self.members[..i].iter_mut().enumerate() {
                    if let Err(undo) = locked.unlock() {
                        warn!(member = j, error = %undo, "unable to release family member lock");
                    }
                }
                return Err(e);
            }
        }
        Ok(())
    }

    fn unlock(&mut self) -> Result<()> {
        broadcast(&mut self.members, "unlock", FileHandle::unlock)
    }

    fn close(mut self: Box<Self>) -> Result<()> {
        let members = mem::take(&mut self.members);
        let count = members.len();
        let mut first = None;
        for (i, member) in members.into_iter().enumerate() {
            if let Err(e) = member.close() {
                if first.is_none() {
                    first = Some((i, e));
                } else {
                    warn!(member = i, error = %e, "family member close failed");
                }
            }
        }
        debug!(template = %self.template, members = count, "closed family file");
        match first {
            Some((i, e)) => Err(VfdError::CannotClose {
                context: format!("family member {i}"),
                source: Box::new(e),
            }),
            None => Ok(()),
        }
    }

    fn ctl(&mut self, op: CtlOp, input: &[u8]) -> Result<Vec<u8>> {
        if op.flags.contains(CtlFlags::ROUTE_TO_TERMINAL) {
            if let Some(member) = self.members.first_mut() {
                return member.ctl(op, input);
            }
        }
        unknown_ctl(self.driver_name(), op)
    }

    fn sb_size(&self) -> usize {
        SB_SIZE
    }

    fn sb_encode(&self) -> Result<Option<DriverInfo>> {
        let mut data = vec![0u8; SB_SIZE];
        LittleEndian::write_u64(&mut data, self.stored_size());
        Ok(Some(DriverInfo { name: SB_TAG, data }))
    }

    fn sb_decode(&mut self, info: &DriverInfo) -> Result<()> {
        if info.name != SB_TAG {
            return Err(VfdError::BadValue(format!(
                "driver record tag '{}' is not a family record",
                String::from_utf8_lossy(&info.name)
            )));
        }
        if info.data.len() != SB_SIZE {
            return Err(VfdError::BadValue(format!(
                "family record is {} bytes, expected {SB_SIZE}",
                info.data.len()
            )));
        }
        let stored = LittleEndian::read_u64(&info.data);

        if let Some(new_size) = self.mem_newsize {
            debug!(stored, new_size, "repartitioning family");
            self.memb_size = new_size;
            self.pmem_size = new_size;
            return Ok(());
        }
        if self.pmem_size == FAMILY_DEFAULT {
            self.pmem_size = stored;
        }
        if stored != self.pmem_size {
            return Err(VfdError::BadValue(format!(
                "family member size is {stored}, but the access configuration says {}",
                self.pmem_size
            )));
        }
        self.memb_size = stored;
        Ok(())
    }
}

/// Apply `op` to every member; report the first failure and log the rest.
fn broadcast(
    members: &mut [FileHandle],
    what: &str,
    op: fn(&mut FileHandle) -> Result<()>,
) -> Result<()> {
    let mut first = None;
    for (i, member) in members.iter_mut().enumerate() {
        if let Err(e) = op(member) {
            if first.is_none() {
                first = Some(e);
            } else {
                warn!(member = i, error = %e, "family member {what} failed");
            }
        }
    }
    first.map_or(Ok(()), Err)
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

/// Registry entry for the family driver.
#[derive(Debug, Clone, Copy, Default)]
pub struct FamilyDriver;

impl Driver for FamilyDriver {
    fn name(&self) -> &'static str {
        "family"
    }

    fn maxaddr(&self) -> Haddr {
        MAX_ADDR
    }

    fn fapl_size(&self) -> usize {
        mem::size_of::<FamilyConfig>()
    }

    fn open(
        &self,
        name: &str,
        flags: AccessFlags,
        fapl: &AccessConfig,
        maxaddr: Haddr,
    ) -> Result<Box<dyn VirtualFile>> {
        Ok(Box::new(FamilyFile::open(name, flags, fapl, maxaddr)?))
    }

    /// Delete members in order until one is missing. Only a missing first
    /// member is an error. Members after the first are deleted only while
    /// their file exists, since unbacked core members never fail.
    fn delete(&self, name: &str, fapl: &AccessConfig) -> Result<()> {
        let template = resolve_template(name, false)?;
        let mut member_fapl = fapl
            .family_config()
            .map(|c| (*c.member).clone())
            .unwrap_or_default();
        member_fapl.locking = fapl.locking;

        let mut idx = 0;
        loop {
            let member_name = template.expand(idx);
            if idx > 0 && !Path::new(&member_name).exists() {
                break;
            }
            match FileHandle::delete(&member_name, &member_fapl) {
                Ok(()) => idx += 1,
                Err(e) if idx == 0 => return Err(e),
                Err(_) => break,
            }
        }
        debug!(template = %template, members = idx, "deleted family");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_file::CoreConfig;
    use crate::error::ErrorKind;

    fn memory_family(memb_size: u64) -> FamilyConfig {
        FamilyConfig::new(memb_size).with_member_access(AccessConfig::core(CoreConfig::in_memory(256)))
    }

    fn open_memory(name: &str, memb_size: u64) -> FamilyFile {
        let fapl = AccessConfig::family(memory_family(memb_size));
        FamilyFile::open(name, AccessFlags::create_truncate(), &fapl, MAX_ADDR).unwrap()
    }

    #[test]
    fn map_range_splits_at_member_edges() {
        assert_eq!(
            map_range(1024, 1022, 5),
            vec![
                MemberIo { member: 0, offset: 1022, buf_offset: 0, len: 2 },
                MemberIo { member: 1, offset: 0, buf_offset: 2, len: 3 },
            ]
        );
        let ops = map_range(100, 50, 300);
        assert_eq!(ops.len(), 4);
        assert_eq!(ops.iter().map(|o| o.len).sum::<usize>(), 300);
        assert_eq!(ops[3], MemberIo { member: 3, offset: 0, buf_offset: 250, len: 50 });
        assert!(map_range(100, 7, 0).is_empty());
    }

    #[test]
    fn writes_create_members_lazily() {
        let mut fam = open_memory("memfam-a-%d", 1024);
        assert_eq!(fam.member_count(), 1);
        fam.write(MemType::Default, 1022, b"HELLO").unwrap();
        assert_eq!(fam.member_count(), 2);
        fam.write(MemType::Default, 5000, b"!").unwrap();
        assert_eq!(fam.member_count(), 5);
        assert_eq!(fam.eof(MemType::Default), 4 * 1024 + 1024);

        let mut buf = [0u8; 5];
        fam.read(MemType::Default, 1022, &mut buf).unwrap();
        assert_eq!(&buf, b"HELLO");
        let mut tail = [0xFFu8; 4];
        fam.read(MemType::Default, 9000, &mut tail).unwrap();
        assert_eq!(tail, [0; 4]);
    }

    #[test]
    fn set_eoa_spreads_over_members() {
        let mut fam = open_memory("memfam-b-%d", 1000);
        fam.set_eoa(MemType::Default, 2500).unwrap();
        assert_eq!(fam.member_count(), 3);
        let eoas: Vec<_> = (0..3)
            .map(|i| fam.member(i).unwrap().eoa(MemType::Default))
            .collect();
        assert_eq!(eoas, [1000, 1000, 500]);

        fam.set_eoa(MemType::Default, 1200).unwrap();
        let eoas: Vec<_> = (0..3)
            .map(|i| fam.member(i).unwrap().eoa(MemType::Default))
            .collect();
        assert_eq!(eoas, [1000, 200, 0]);
        assert_eq!(fam.eoa(MemType::Default), 1200);
    }

    #[test]
    fn boot_block_record_round_trips() {
        let fam = open_memory("memfam-c-%d", 4096);
        let info = fam.sb_encode().unwrap().unwrap();
        assert_eq!(&info.name, b"NCSAfami");
        assert_eq!(info.data, 4096u64.to_le_bytes());
        assert_eq!(fam.sb_size(), 8);

        let mut other = open_memory("memfam-d-%d", 4096);
        other.sb_decode(&info).unwrap();

        let mut wrong = open_memory("memfam-e-%d", 2048);
        assert_eq!(wrong.sb_decode(&info).unwrap_err().kind(), ErrorKind::BadValue);

        let bad_tag = DriverInfo { name: *b"NCSAmult", data: info.data.clone() };
        assert_eq!(other.sb_decode(&bad_tag).unwrap_err().kind(), ErrorKind::BadValue);
    }

    #[test]
    fn repartition_overrides_stored_size() {
        let info = DriverInfo { name: SB_TAG, data: 4096u64.to_le_bytes().to_vec() };
        let fapl = AccessConfig::family(memory_family(4096).with_repartition(8192));
        let mut fam = FamilyFile::open("memfam-f-%d", AccessFlags::create_truncate(), &fapl, MAX_ADDR).unwrap();
        assert!(fam.features().contains(Features::DIRTY_DRVRINFO_LOAD));
        fam.sb_decode(&info).unwrap();
        assert_eq!(fam.member_size(), 8192);
        assert_eq!(fam.sb_encode().unwrap().unwrap().data, 8192u64.to_le_bytes());
    }

    #[test]
    fn ctl_routes_to_first_member() {
        let mut fam = open_memory("memfam-g-%d", 64);
        let routed = CtlOp::new(9, CtlFlags::ROUTE_TO_TERMINAL | CtlFlags::FAIL_IF_UNKNOWN);
        let err = fam.ctl(routed, &[]).unwrap_err();
        assert!(err.to_string().contains("core"));
        assert!(fam.ctl(CtlOp::new(9, CtlFlags::empty()), &[]).unwrap().is_empty());
    }

    #[test]
    fn malformed_names_are_rejected() {
        let fapl = AccessConfig::family(memory_family(64));
        let err = FamilyFile::open("two-%d-%d", AccessFlags::create_truncate(), &fapl, MAX_ADDR)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BadArg);

        let template = resolve_template("pct-%%-%02d", false).unwrap();
        assert_eq!(template.expand(3), "pct-%-03");
    }

    #[test]
    fn delete_with_memory_members_stops_at_first_missing_file() {
        let mut fam = open_memory("memfam-del-%d", 64);
        fam.write(MemType::Default, 0, &[1; 100]).unwrap();
        assert_eq!(fam.member_count(), 2);
        Box::new(fam).close().unwrap();

        let fapl = AccessConfig::family(memory_family(64));
        FamilyDriver.delete("memfam-del-%d", &fapl).unwrap();
    }
}
