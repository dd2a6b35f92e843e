//! Virtual file drivers for rustyhdf5.
//!
//! The library above never touches a file directly: it asks the virtual
//! file layer for a [`FileHandle`] and does all byte-level I/O through it.
//! Which driver serves the handle is chosen by an [`AccessConfig`]:
//!
//! - **sec2** ([`Sec2Driver`]): one OS file, positional reads and writes.
//! - **core** ([`CoreDriver`]): the whole file in memory, optionally backed
//!   by a file and written back page by page.
//! - **family** ([`FamilyDriver`]): one address space striped over
//!   fixed-size member files.
//!
//! ```
//! use rustyhdf5_vfd::{AccessConfig, AccessFlags, CoreConfig, FileHandle, MemType, UNDEF};
//!
//! let fapl = AccessConfig::core(CoreConfig::in_memory(4096));
//! let mut file = FileHandle::open("scratch.h5", AccessFlags::create_truncate(), &fapl, UNDEF)?;
//! file.write(MemType::Draw, 100, b"bytes")?;
//! let mut buf = [0u8; 5];
//! file.read(MemType::Draw, 100, &mut buf)?;
//! assert_eq!(&buf, b"bytes");
//! assert_eq!(file.eof(MemType::Default), 4096);
//! file.close()?;
//! # Ok::<(), rustyhdf5_vfd::VfdError>(())
//! ```

pub mod addr;
pub mod config;
pub mod core_file;
pub mod dirty;
pub mod error;
pub mod family;
pub mod flags;
pub mod image;
pub mod registry;
pub mod sec2;
mod sys;
pub mod template;
pub mod vfl;

pub use addr::{Haddr, MemType, Region, MAX_ADDR, UNDEF};
pub use config::{AccessConfig, DriverConfig, FileImage, FileLocking};
pub use core_file::{CoreConfig, CoreDriver, CoreFile};
pub use dirty::DirtySet;
pub use error::{ErrorKind, Result, VfdError};
pub use family::{FamilyConfig, FamilyDriver, FamilyFile, FAMILY_DEFAULT};
pub use flags::{AccessFlags, CtlFlags, Features};
pub use image::{ImageCallbacks, ImageOp, SystemImage};
pub use registry::{DriverEntry, DriverId};
pub use sec2::{Sec2Driver, Sec2File};
pub use sys::FileIdentity;
pub use template::MemberTemplate;
pub use vfl::{CtlOp, Driver, DriverInfo, FileHandle, HandleState, NativeHandle, VirtualFile};
