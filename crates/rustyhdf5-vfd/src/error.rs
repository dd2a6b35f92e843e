//! Error types for the virtual file layer and its drivers.

use std::io;

use rustyhdf5_skiplist::SkipListError;

/// The closed set of failure kinds a driver operation can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    BadArg,
    BadAddr,
    AddrOverflow,
    CannotOpen,
    FileExists,
    ReadError,
    WriteError,
    SeekError,
    AllocFailed,
    CannotLock,
    CannotUnlock,
    CantInsert,
    CannotFlush,
    CannotClose,
    CannotDelete,
    BadValue,
    Unsupported,
}

/// Error returned by every fallible VFL and driver operation.
#[derive(Debug, thiserror::Error)]
pub enum VfdError {
    /// Empty name, invalid setting, unknown driver, malformed template.
    #[error("bad argument: {0}")]
    BadArg(String),

    /// Address ceiling of zero or `UNDEF`, or above the driver's limit.
    #[error("bad address: {0}")]
    BadAddr(String),

    /// `addr + size` wraps or passes the largest legal address.
    #[error("address overflow: addr={addr:#x}, size={size}")]
    AddrOverflow { addr: u64, size: u64 },

    #[error("unable to open file '{path}'")]
    CannotOpen {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("file already exists: '{0}'")]
    FileExists(String),

    #[error("read failed: addr={addr:#x}, size={size}")]
    ReadError {
        addr: u64,
        size: u64,
        #[source]
        source: io::Error,
    },

    #[error("write failed: addr={addr:#x}, size={size}")]
    WriteError {
        addr: u64,
        size: u64,
        #[source]
        source: io::Error,
    },

    /// Truncating or positioning the underlying file failed.
    #[error("unable to resize or position file: {context}")]
    SeekError {
        context: String,
        #[source]
        source: io::Error,
    },

    /// The allocator or an image `realloc` callback refused the request.
    #[error("unable to allocate {size} bytes")]
    AllocFailed { size: u64 },

    #[error("unable to lock file")]
    CannotLock(#[source] io::Error),

    #[error("unable to unlock file")]
    CannotUnlock(#[source] io::Error),

    #[error("unable to insert into ordered map")]
    CantInsert(#[from] SkipListError),

    #[error("unable to flush: {context}")]
    CannotFlush {
        context: String,
        #[source]
        source: Box<VfdError>,
    },

    #[error("unable to close: {context}")]
    CannotClose {
        context: String,
        #[source]
        source: Box<VfdError>,
    },

    #[error("unable to delete '{path}'")]
    CannotDelete {
        path: String,
        #[source]
        source: io::Error,
    },

    /// Stored driver information disagrees with the configuration.
    #[error("bad value: {0}")]
    BadValue(String),

    /// The driver does not provide this optional operation.
    #[error("operation not supported: {0}")]
    Unsupported(String),
}

impl VfdError {
    /// The kind of failure, without payload.
    pub fn kind(&self) -> ErrorKind {
        match self {
            VfdError::BadArg(_) => ErrorKind::BadArg,
            VfdError::BadAddr(_) => ErrorKind::BadAddr,
            VfdError::AddrOverflow { .. } => ErrorKind::AddrOverflow,
            VfdError::CannotOpen { .. } => ErrorKind::CannotOpen,
            VfdError::FileExists(_) => ErrorKind::FileExists,
            VfdError::ReadError { .. } => ErrorKind::ReadError,
            VfdError::WriteError { .. } => ErrorKind::WriteError,
            VfdError::SeekError { .. } => ErrorKind::SeekError,
            VfdError::AllocFailed { .. } => ErrorKind::AllocFailed,
            VfdError::CannotLock(_) => ErrorKind::CannotLock,
            VfdError::CannotUnlock(_) => ErrorKind::CannotUnlock,
            VfdError::CantInsert(_) => ErrorKind::CantInsert,
            VfdError::CannotFlush { .. } => ErrorKind::CannotFlush,
            VfdError::CannotClose { .. } => ErrorKind::CannotClose,
            VfdError::CannotDelete { .. } => ErrorKind::CannotDelete,
            VfdError::BadValue(_) => ErrorKind::BadValue,
            VfdError::Unsupported(_) => ErrorKind::Unsupported,
        }
    }

    /// Whether the skip list rejected a duplicate key.
    pub fn is_duplicate_key(&self) -> bool {
        matches!(self, VfdError::CantInsert(SkipListError::DuplicateKey))
    }
}

/// Result alias for VFL operations.
pub type Result<T> = std::result::Result<T, VfdError>;
