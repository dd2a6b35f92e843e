//! Shared helpers for the driver integration tests.

#![allow(dead_code)]

use std::path::{Path, PathBuf};

use rustyhdf5_vfd::config::ENV_NOCLEANUP;
use tempfile::TempDir;

/// A scratch directory removed at drop unless `HDF5_NOCLEANUP` is set.
pub struct Scratch {
    dir: Option<TempDir>,
}

impl Scratch {
    pub fn new() -> Self {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
        Self {
            dir: Some(tempfile::tempdir().unwrap()),
        }
    }

    pub fn path(&self) -> &Path {
        self.dir.as_ref().unwrap().path()
    }

    /// `name` inside the scratch directory, as a UTF-8 string.
    pub fn file(&self, name: &str) -> String {
        self.path().join(name).to_str().unwrap().to_owned()
    }

    pub fn join(&self, name: &str) -> PathBuf {
        self.path().join(name)
    }
}

impl Drop for Scratch {
    fn drop(&mut self) {
        if std::env::var_os(ENV_NOCLEANUP).is_some() {
            if let Some(dir) = self.dir.take() {
                eprintln!("keeping scratch files in {}", dir.path().display());
                std::mem::forget(dir);
            }
        }
    }
}

/// `len` bytes of a repeating, position-dependent pattern.
pub fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}
