//! File-access configuration.
//!
//! An [`AccessConfig`] selects a driver, carries that driver's settings,
//! the advisory locking policy and an optional initial file image. It can
//! be built in code or taken from the environment:
//!
//! | Variable | Meaning |
//! |---|---|
//! | `HDF5_DRIVER` | driver or preset name (`sec2`, `core`, `core_paged`, `family`, or a registered name) |
//! | `HDF5_DRIVER_CONFIG` | `key=value` pairs for that driver, separated by commas or spaces |
//! | `HDF5_USE_FILE_LOCKING` | `TRUE`, `FALSE` or `BEST_EFFORT` |
//!
//! A bare integer in `HDF5_DRIVER_CONFIG` sets the core `increment` or the
//! family member size.

use std::sync::Arc;

use tracing::debug;

use crate::core_file::CoreConfig;
use crate::error::{Result, VfdError};
use crate::family::FamilyConfig;
use crate::registry::{self, DriverId};

pub const ENV_DRIVER: &str = "HDF5_DRIVER";
pub const ENV_DRIVER_CONFIG: &str = "HDF5_DRIVER_CONFIG";
pub const ENV_USE_FILE_LOCKING: &str = "HDF5_USE_FILE_LOCKING";
/// Keeps test scratch files around. Only the test helpers look at it.
pub const ENV_NOCLEANUP: &str = "HDF5_NOCLEANUP";

/// Advisory file-locking policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FileLocking {
    /// Take locks; any failure is an error.
    #[default]
    Enabled,
    /// Never lock.
    Disabled,
    /// Take locks, but treat "not supported by this file system" as success.
    BestEffort,
}

impl FileLocking {
    /// Parse an `HDF5_USE_FILE_LOCKING` value.
    pub fn parse(value: &str) -> Result<Self> {
        match value.trim() {
            "TRUE" | "1" => Ok(Self::Enabled),
            "FALSE" | "0" => Ok(Self::Disabled),
            "BEST_EFFORT" => Ok(Self::BestEffort),
            other => Err(VfdError::BadArg(format!(
                "{ENV_USE_FILE_LOCKING}: expected TRUE, FALSE or BEST_EFFORT, got '{other}'"
            ))),
        }
    }
}

/// An initial file image shared with the core driver.
#[derive(Debug, Clone)]
pub struct FileImage(Arc<[u8]>);

impl FileImage {
    /// Wrap image bytes.
    pub fn new(bytes: impl Into<Arc<[u8]>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<u8>> for FileImage {
    fn from(bytes: Vec<u8>) -> Self {
        Self::new(bytes)
    }
}

/// Driver-specific settings.
#[derive(Debug, Clone)]
pub enum DriverConfig {
    /// The driver takes no settings (sec2, most user drivers).
    None,
    Core(CoreConfig),
    Family(FamilyConfig),
}

/// Everything a driver needs to open a file besides its name and flags.
#[derive(Debug, Clone)]
pub struct AccessConfig {
    pub driver: DriverId,
    pub config: DriverConfig,
    pub locking: FileLocking,
    pub file_image: Option<FileImage>,
}

impl Default for AccessConfig {
    fn default() -> Self {
        Self::sec2()
    }
}

impl AccessConfig {
    /// The POSIX driver.
    pub fn sec2() -> Self {
        Self::custom(DriverId::SEC2)
    }

    /// The in-memory driver with the given settings.
    pub fn core(config: CoreConfig) -> Self {
        Self {
            config: DriverConfig::Core(config),
            ..Self::custom(DriverId::CORE)
        }
    }

    /// The member-file family driver with the given settings.
    pub fn family(config: FamilyConfig) -> Self {
        Self {
            config: DriverConfig::Family(config),
            ..Self::custom(DriverId::FAMILY)
        }
    }

    /// A registered driver that takes no settings.
    pub fn custom(driver: DriverId) -> Self {
        Self {
            driver,
            config: DriverConfig::None,
            locking: FileLocking::default(),
            file_image: None,
        }
    }

    /// Set the locking policy.
    pub fn with_locking(mut self, locking: FileLocking) -> Self {
        self.locking = locking;
        self
    }

    /// Start the file from an in-memory image (core driver only).
    pub fn with_file_image(mut self, image: impl Into<FileImage>) -> Self {
        self.file_image = Some(image.into());
        self
    }

    pub fn core_config(&self) -> Option<&CoreConfig> {
        match &self.config {
            DriverConfig::Core(c) => Some(c),
            _ => None,
        }
    }

    pub fn family_config(&self) -> Option<&FamilyConfig> {
        match &self.config {
            DriverConfig::Family(c) => Some(c),
            _ => None,
        }
    }

    /// A named preset: `sec2`, `core`, `core_paged`, `family`, or the name
    /// of any registered driver.
    pub fn preset(name: &str) -> Result<Self> {
        match name {
            "sec2" => Ok(Self::sec2()),
            "core" => Ok(Self::core(CoreConfig::default())),
            "core_paged" => Ok(Self::core(CoreConfig::paged())),
            "family" => Ok(Self::family(FamilyConfig::default())),
            other => registry::lookup_name(other).map(Self::custom),
        }
    }

    /// Build a configuration from the process environment.
    ///
    /// Unset variables leave the sec2 defaults in place.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`from_env`](Self::from_env) with a custom variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut fapl = match lookup(ENV_DRIVER) {
            Some(name) if !name.trim().is_empty() => Self::preset(name.trim())?,
            _ => Self::sec2(),
        };
        if let Some(text) = lookup(ENV_DRIVER_CONFIG) {
            fapl.apply_driver_config(&text)?;
        }
        if let Some(value) = lookup(ENV_USE_FILE_LOCKING) {
            fapl.locking = FileLocking::parse(&value)?;
        }
        debug!(driver = ?fapl.driver, locking = ?fapl.locking, "access config from environment");
        Ok(fapl)
    }

    /// Apply a driver configuration string to the selected driver.
    pub fn apply_driver_config(&mut self, text: &str) -> Result<()> {
        let tokens = text
            .split(|c: char| c == ',' || c.is_whitespace())
            .filter(|t| !t.is_empty());
        for token in tokens {
            let (key, value) = match token.split_once('=') {
                Some((k, v)) => (Some(k.trim()), v.trim()),
                None => (None, token),
            };
            match &mut self.config {
                DriverConfig::Core(core) => apply_core_setting(core, key, value)?,
                DriverConfig::Family(family) => apply_family_setting(family, key, value)?,
                DriverConfig::None => {
                    debug!(driver = ?self.driver, token, "driver takes no settings; ignoring");
                }
            }
        }
        Ok(())
    }
}

fn parse_size(key: &str, value: &str) -> Result<u64> {
    value
        .parse::<u64>()
        .map_err(|_| VfdError::BadArg(format!("{key}: expected a byte count, got '{value}'")))
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(VfdError::BadArg(format!("{key}: expected a boolean, got '{value}'"))),
    }
}

fn to_usize(key: &str, value: u64) -> Result<usize> {
    usize::try_from(value).map_err(|_| VfdError::BadArg(format!("{key}: {value} is too large")))
}

fn apply_core_setting(core: &mut CoreConfig, key: Option<&str>, value: &str) -> Result<()> {
    match key {
        None | Some("increment") => core.increment = to_usize("increment", parse_size("increment", value)?)?,
        Some("backing_store") => core.backing_store = parse_bool("backing_store", value)?,
        Some("write_tracking") => core.write_tracking = parse_bool("write_tracking", value)?,
        Some("page_size") => core.page_size = to_usize("page_size", parse_size("page_size", value)?)?,
        Some(other) => {
            return Err(VfdError::BadArg(format!("core driver has no setting '{other}'")));
        }
    }
    Ok(())
}

fn apply_family_setting(family: &mut FamilyConfig, key: Option<&str>, value: &str) -> Result<()> {
    match key {
        None | Some("memb_size") | Some("member_size") => {
            family.memb_size = parse_size("memb_size", value)?;
        }
        Some(other) => {
            return Err(VfdError::BadArg(format!("family driver has no setting '{other}'")));
        }
    }
    Ok(())
}
