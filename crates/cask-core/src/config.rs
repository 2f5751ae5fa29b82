//! Store configuration.
//!
//! Every layout decision is made once here, at open time, and the resulting
//! config is threaded through all components. There is no process-wide store
//! state to consult.

use std::path::{Path, PathBuf};

use crate::store::Namespace;

const DEFAULT_DIR_MODE: u32 = 0o770;

/// Configuration for a [`crate::Store`], built once at open.
#[derive(Clone, Debug)]
pub struct StoreConfig {
    base: PathBuf,
    dir_mode: u32,
}

impl StoreConfig {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self {
            base: base.into(),
            dir_mode: DEFAULT_DIR_MODE,
        }
    }

    /// Override the mode applied to store-managed directories.
    #[must_use]
    pub fn dir_mode(mut self, mode: u32) -> Self {
        self.dir_mode = mode;
        self
    }

    #[must_use]
    pub fn base(&self) -> &Path {
        &self.base
    }

    pub(crate) fn namespace_dir(&self, namespace: Namespace) -> PathBuf {
        self.base.join("cas").join(namespace.as_str())
    }

    pub(crate) fn db_dir(&self) -> PathBuf {
        self.base.join("cas").join("db")
    }

    /// Scratch space for in-flight imports. Not self-cleaning: failed
    /// imports leave their files here for external cleanup.
    pub(crate) fn tmp_dir(&self) -> PathBuf {
        self.base.join("tmp")
    }

    pub(crate) fn mode(&self) -> u32 {
        self.dir_mode
    }
}
