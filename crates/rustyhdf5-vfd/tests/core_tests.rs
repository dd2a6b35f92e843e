//! Covers: the core driver through the VFL: growth by increment, dirty-page
//! coalescing and write-back, close-time truncation, reopen round trips,
//! file images and image callbacks.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use common::{pattern, Scratch};
use rustyhdf5_vfd::{
    AccessConfig, AccessFlags, CoreConfig, CoreFile, ErrorKind, FileHandle, HandleState,
    ImageCallbacks, ImageOp, MemType, NativeHandle, Region, UNDEF,
};

fn core_fapl(config: CoreConfig) -> AccessConfig {
    AccessConfig::core(config)
}

fn create(name: &str, config: CoreConfig) -> FileHandle {
    FileHandle::open(name, AccessFlags::create_truncate(), &core_fapl(config), UNDEF).unwrap()
}

fn dirty(handle: &FileHandle) -> Vec<(u64, u64)> {
    handle
        .downcast_ref::<CoreFile>()
        .unwrap()
        .dirty_regions()
        .iter()
        .map(Region::bounds)
        .collect()
}

// ---- End-to-end scenarios ----

#[test]
fn write_extends_by_increment() {
    let scratch = Scratch::new();
    let mut file = create(&scratch.file("extend.h5"), CoreConfig::in_memory(8192));
    file.write(MemType::Draw, 0, &[1, 2, 3, 4]).unwrap();
    assert_eq!(file.eof(MemType::Default), 8192);

    let mut buf = [0xEEu8; 8];
    file.read(MemType::Draw, 0, &mut buf).unwrap();
    assert_eq!(buf, [1, 2, 3, 4, 0, 0, 0, 0]);
    file.close().unwrap();
    assert!(!scratch.join("extend.h5").exists());
}

#[test]
fn dirty_pages_coalesce() {
    let scratch = Scratch::new();
    let config = CoreConfig::paged().with_page_size(4096).with_increment(65536);
    let mut file = create(&scratch.file("pages.h5"), config);

    file.write(MemType::Draw, 0, &[1]).unwrap();
    assert_eq!(dirty(&file), [(0, 4095)]);
    file.write(MemType::Draw, 5000, &[2]).unwrap();
    file.write(MemType::Draw, 4097, &[3]).unwrap();
    assert_eq!(dirty(&file), [(0, 8191)]);
    file.write(MemType::Draw, 4096, &[4]).unwrap();
    assert_eq!(dirty(&file), [(0, 8191)]);

    file.write(MemType::Draw, 20_000, &[5]).unwrap();
    assert_eq!(dirty(&file), [(0, 8191), (16384, 20479)]);

    file.flush().unwrap();
    assert!(dirty(&file).is_empty());
    file.close().unwrap();

    let on_disk = std::fs::read(scratch.join("pages.h5")).unwrap();
    assert_eq!(on_disk.len(), 20480);
    assert_eq!(&on_disk[..1], &[1]);
    assert_eq!(&on_disk[4096..4098], &[4, 3]);
    assert_eq!(on_disk[5000], 2);
    assert_eq!(on_disk[20_000], 5);
}

#[test]
fn close_truncates_backing_file_to_eoa() {
    let scratch = Scratch::new();
    let name = scratch.file("trunc.h5");
    let mut file = create(&name, CoreConfig::default().with_increment(1024));
    file.set_eoa(MemType::Default, 10).unwrap();
    file.close().unwrap();

    assert_eq!(std::fs::metadata(&name).unwrap().len(), 10);
    let fapl = core_fapl(CoreConfig::default().with_increment(1024));
    let file = FileHandle::open(&name, AccessFlags::RDONLY, &fapl, UNDEF).unwrap();
    assert_eq!(file.eof(MemType::Default), 10);
    file.close().unwrap();
}

// ---- Properties ----

#[test]
fn reopen_reads_back_what_was_written() {
    let scratch = Scratch::new();
    let name = scratch.file("roundtrip.h5");
    let data = pattern(10_000, 3);

    let mut file = create(&name, CoreConfig::default().with_increment(4096));
    file.write(MemType::Draw, 1234, &data).unwrap();
    file.set_eoa(MemType::Default, 1234 + data.len() as u64).unwrap();
    file.close().unwrap();

    let fapl = core_fapl(CoreConfig::default());
    let file = FileHandle::open(&name, AccessFlags::RDONLY, &fapl, UNDEF).unwrap();
    let mut back = vec![0u8; data.len()];
    file.read(MemType::Draw, 1234, &mut back).unwrap();
    assert_eq!(back, data);
    file.close().unwrap();
}

#[test]
fn second_flush_changes_nothing() {
    let scratch = Scratch::new();
    let name = scratch.file("idem.h5");
    let mut file = create(&name, CoreConfig::paged());
    file.write(MemType::Draw, 100, b"first").unwrap();
    file.flush().unwrap();
    let once = std::fs::read(&name).unwrap();
    file.flush().unwrap();
    assert_eq!(file.state(), HandleState::Clean);
    assert_eq!(std::fs::read(&name).unwrap(), once);
    file.close().unwrap();
}

#[test]
fn untracked_backing_store_writes_whole_image() {
    let scratch = Scratch::new();
    let name = scratch.file("whole.h5");
    let mut file = create(&name, CoreConfig::default().with_increment(512));
    file.write(MemType::Draw, 600, b"xyz").unwrap();
    assert!(dirty(&file).is_empty());
    file.close().unwrap();

    let on_disk = std::fs::read(&name).unwrap();
    assert_eq!(on_disk.len(), 1024);
    assert_eq!(&on_disk[600..603], b"xyz");
}

#[test]
fn reads_past_eof_are_zero() {
    let file = CoreFile::open_image(b"abc", CoreConfig::in_memory(64)).unwrap();
    let mut buf = [0x55u8; 6];
    file.read(MemType::Draw, 1, &mut buf).unwrap();
    assert_eq!(buf, [b'b', b'c', 0, 0, 0, 0]);
    let mut far = [0x55u8; 2];
    file.read(MemType::Draw, 1 << 40, &mut far).unwrap();
    assert_eq!(far, [0, 0]);
}

// ---- Errors ----

#[test]
fn read_only_handle_refuses_writes() {
    let scratch = Scratch::new();
    let name = scratch.file("ro.h5");
    std::fs::write(&name, b"data").unwrap();

    let fapl = core_fapl(CoreConfig::default());
    let mut file = FileHandle::open(&name, AccessFlags::RDONLY, &fapl, UNDEF).unwrap();
    let err = file.write(MemType::Draw, 0, b"x").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::WriteError);
    assert_eq!(file.state(), HandleState::Open);
    file.close().unwrap();
    assert_eq!(std::fs::read(&name).unwrap(), b"data");
}

#[test]
fn missing_file_without_create_fails() {
    let scratch = Scratch::new();
    let fapl = core_fapl(CoreConfig::in_memory(1024));
    let err = FileHandle::open(&scratch.file("absent.h5"), AccessFlags::RDWR, &fapl, UNDEF)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CannotOpen);
}

#[test]
fn zero_increment_is_rejected() {
    let scratch = Scratch::new();
    let fapl = core_fapl(CoreConfig::in_memory(0));
    let err = FileHandle::open(&scratch.file("zero.h5"), AccessFlags::create_truncate(), &fapl, UNDEF)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BadArg);
}

// ---- File images ----

#[test]
fn file_image_seeds_a_new_file() {
    let scratch = Scratch::new();
    let name = scratch.file("image.h5");
    let fapl = core_fapl(CoreConfig::in_memory(1024)).with_file_image(b"seeded".to_vec());

    let file = FileHandle::open(&name, AccessFlags::RDWR, &fapl, UNDEF).unwrap();
    assert_eq!(file.eof(MemType::Default), 6);
    let mut buf = [0u8; 6];
    file.read(MemType::Draw, 0, &mut buf).unwrap();
    assert_eq!(&buf, b"seeded");
    file.close().unwrap();

    std::fs::write(&name, b"x").unwrap();
    let err = FileHandle::open(&name, AccessFlags::RDWR, &fapl, UNDEF).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::FileExists);
}

#[derive(Debug, Default)]
struct Counting {
    allocs: AtomicUsize,
    reallocs: AtomicUsize,
    frees: AtomicUsize,
    limit: usize,
}

impl ImageCallbacks for Counting {
    fn alloc(&self, size: usize, _op: ImageOp) -> Option<Vec<u8>> {
        self.allocs.fetch_add(1, Ordering::SeqCst);
        Some(vec![0; size])
    }

    fn realloc(&self, buf: &mut Vec<u8>, new_size: usize, op: ImageOp) -> bool {
        assert_eq!(op, ImageOp::FileResize);
        if new_size > self.limit {
            return false;
        }
        self.reallocs.fetch_add(1, Ordering::SeqCst);
        buf.resize(new_size, 0);
        true
    }

    fn free(&self, _buf: Vec<u8>, op: ImageOp) {
        assert_eq!(op, ImageOp::FileClose);
        self.frees.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn image_callbacks_see_every_buffer_operation() {
    let callbacks = Arc::new(Counting {
        limit: 4096,
        ..Counting::default()
    });
    let config = CoreConfig::in_memory(1024).with_image_callbacks(callbacks.clone());
    let mut file = CoreFile::open_image(b"hdr", config).unwrap();
    assert_eq!(callbacks.allocs.load(Ordering::SeqCst), 1);

    file.write(MemType::Draw, 2000, &[7]).unwrap();
    assert_eq!(callbacks.reallocs.load(Ordering::SeqCst), 1);
    assert_eq!(file.eof(MemType::Default), 2048);

    file.close().unwrap();
    assert_eq!(callbacks.frees.load(Ordering::SeqCst), 1);
}

#[test]
fn failed_growth_leaves_file_untouched() {
    let callbacks = Arc::new(Counting {
        limit: 1024,
        ..Counting::default()
    });
    let config = CoreConfig::paged()
        .with_backing_store(false)
        .with_increment(1024)
        .with_image_callbacks(callbacks);
    let mut file = CoreFile::open_image(&[], config).unwrap();
    file.write(MemType::Draw, 0, b"keep").unwrap();

    let err = file.write(MemType::Draw, 1020, b"too far").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AllocFailed);
    assert_eq!(file.eof(MemType::Default), 1024);
    let core = file.downcast_ref::<CoreFile>().unwrap();
    assert_eq!(&core.as_bytes()[..4], b"keep");
    assert!(core.as_bytes()[4..].iter().all(|&b| b == 0));
    assert!(core.dirty_regions().is_empty());
}

#[test]
fn native_handle_follows_backing() {
    let scratch = Scratch::new();
    let backed = create(&scratch.file("native.h5"), CoreConfig::default());
    assert!(matches!(backed.native_handle(0).unwrap(), NativeHandle::File(_)));
    backed.close().unwrap();

    let memory = CoreFile::open_image(b"mem", CoreConfig::in_memory(16)).unwrap();
    assert!(matches!(memory.native_handle(0).unwrap(), NativeHandle::Memory(b"mem")));
}
