//! Open flags, driver capability bits and `ctl` request flags.

use bitflags::bitflags;

bitflags! {
    /// How a file is opened. The empty set means read-only.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct AccessFlags: u32 {
        /// Open for reading and writing.
        const RDWR  = 0x0001;
        /// Truncate an existing file to zero length.
        const TRUNC = 0x0002;
        /// Fail if the file already exists (with `CREAT`).
        const EXCL  = 0x0004;
        /// Create the file if it does not exist.
        const CREAT = 0x0010;
    }
}

impl AccessFlags {
    /// Read-only access.
    pub const RDONLY: Self = Self::empty();

    /// Flags used to create a new file, replacing any existing one.
    pub fn create_truncate() -> Self {
        Self::RDWR | Self::CREAT | Self::TRUNC
    }

    /// Whether writes are allowed.
    pub fn is_writable(self) -> bool {
        self.contains(Self::RDWR)
    }

    /// The flags with the create-time bits removed, for reopening members
    /// that must already exist.
    pub fn without_create(self) -> Self {
        self - (Self::CREAT | Self::TRUNC | Self::EXCL)
    }
}

bitflags! {
    /// Capabilities a driver advertises to the layers above it.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Features: u64 {
        /// Metadata allocations may be aggregated into larger blocks.
        const AGGREGATE_METADATA           = 0x0001;
        /// Metadata writes and reads may be accumulated in memory.
        const ACCUMULATE_METADATA          = 0x0006;
        /// Raw data reads may go through a sieve buffer.
        const DATA_SIEVE                   = 0x0008;
        /// Small raw data allocations may be aggregated.
        const AGGREGATE_SMALLDATA          = 0x0010;
        /// Stored driver information changed at load time and must be
        /// rewritten.
        const DIRTY_DRVRINFO_LOAD          = 0x0040;
        /// The native handle is a POSIX-compatible file.
        const POSIX_COMPAT_HANDLE          = 0x0080;
        /// The driver can start from an in-memory file image.
        const ALLOW_FILE_IMAGE             = 0x0400;
        /// The driver calls user image callbacks for its buffer.
        const CAN_USE_FILE_IMAGE_CALLBACKS = 0x0800;
        /// Files written by this driver are readable by the default driver.
        const DEFAULT_VFD_COMPATIBLE       = 0x8000;
    }
}

impl Features {
    /// The four allocation/caching hints shared by the byte-addressed
    /// drivers.
    pub fn standard() -> Self {
        Self::AGGREGATE_METADATA
            | Self::ACCUMULATE_METADATA
            | Self::DATA_SIEVE
            | Self::AGGREGATE_SMALLDATA
    }
}

bitflags! {
    /// Flags on a [`CtlOp`](crate::vfl::CtlOp).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct CtlFlags: u32 {
        /// Fail when the driver does not know the op code.
        const FAIL_IF_UNKNOWN   = 0x0001;
        /// Pass the request down to the terminal (member) driver.
        const ROUTE_TO_TERMINAL = 0x0002;
    }
}
