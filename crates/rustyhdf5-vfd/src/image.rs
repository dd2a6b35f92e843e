//! Buffer-management callbacks for the core driver's file image.
//!
//! Callers that embed an existing image, or want the image kept in memory
//! they manage, implement [`ImageCallbacks`]. Any state the callbacks need
//! lives in the implementing type.

use std::fmt;

/// Which driver operation triggered a callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageOp {
    FileOpen,
    FileResize,
    FileClose,
}

/// Replaceable allocation and copy primitives for the core image buffer.
pub trait ImageCallbacks: fmt::Debug + Send + Sync {
    /// A zeroed buffer of exactly `size` bytes, or `None` on failure.
    fn alloc(&self, size: usize, _op: ImageOp) -> Option<Vec<u8>> {
        let mut buf = Vec::new();
        buf.try_reserve_exact(size).ok()?;
        buf.resize(size, 0);
        Some(buf)
    }

    /// Copy `src` into `dest`; both have the same length.
    fn copy(&self, dest: &mut [u8], src: &[u8], _op: ImageOp) {
        dest.copy_from_slice(src);
    }

    /// Resize `buf` to exactly `new_size` bytes. Returns `false`, leaving
    /// `buf` untouched, when the memory cannot be had.
    fn realloc(&self, buf: &mut Vec<u8>, new_size: usize, _op: ImageOp) -> bool {
        if new_size > buf.len() && buf.try_reserve_exact(new_size - buf.len()).is_err() {
            return false;
        }
        buf.resize(new_size, 0);
        true
    }

    /// Release a buffer.
    fn free(&self, buf: Vec<u8>, _op: ImageOp) {
        drop(buf);
    }
}

/// The global allocator.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemImage;

impl ImageCallbacks for SystemImage {}
