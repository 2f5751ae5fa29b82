//! Store façade composing the disk backend, metadata index, key resolver,
//! and import pipeline behind a single handle.
//!
//! Callers never touch the backend or index directly; everything goes
//! through [`Store`], which owns the base directory and enforces the
//! blob, manifest, index-row commit order on import.

mod backend;
pub(crate) mod index;
mod import;

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::debug;

use cask_domain::{FileType, ImageManifest};

use crate::config::StoreConfig;
use crate::key;

pub use backend::Namespace;
pub use index::{ImageInfo, Remote, SCHEMA_VERSION};

use backend::DiskStore;
use index::Index;

/// Classified store errors. Pipeline stages add `anyhow` context naming the
/// stage; these variants are what callers branch on via `downcast_ref`.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("unrecognized image header")]
    UnknownArchiveType,
    #[error("unsupported compression: {0}")]
    UnsupportedCompression(FileType),
    #[error("no value for key {key} in {namespace}")]
    MissingKey {
        namespace: &'static str,
        key: String,
    },
    #[error("no keys found")]
    NoKeysFound,
    #[error("ambiguous key: {0:?}")]
    AmbiguousKey(String),
    #[error("store schema version {found} is older than the supported version {expected}")]
    SchemaTooOld { found: i64, expected: i64 },
    #[error("store schema version {found} is newer than the supported version {expected}")]
    SchemaTooNew { found: i64, expected: i64 },
    #[error("image {key} is stored but its {stage} was not written")]
    PartialImport { key: String, stage: &'static str },
}

/// Content-addressable store for immutable image archives.
#[derive(Clone, Debug)]
pub struct Store {
    pub(crate) config: StoreConfig,
    pub(crate) backend: DiskStore,
    pub(crate) index: Index,
}

impl Store {
    /// Open a store rooted at `base`, creating its layout on first use.
    ///
    /// # Errors
    ///
    /// Fails when the layout cannot be created or when the metadata index
    /// carries a schema version other than [`SCHEMA_VERSION`]; older and
    /// newer stores are both rejected before any read or write can happen.
    pub fn open(base: impl Into<PathBuf>) -> Result<Self> {
        Self::with_config(StoreConfig::new(base))
    }

    pub fn with_config(config: StoreConfig) -> Result<Self> {
        for namespace in [Namespace::Blob, Namespace::Manifest] {
            ensure_dir(&config.namespace_dir(namespace), config.mode())?;
        }
        let db_dir = config.db_dir();
        ensure_dir(&db_dir, config.mode())?;
        ensure_dir(&config.tmp_dir(), config.mode())?;

        let index = Index::open(&db_dir)?;
        let backend = DiskStore::new(config.clone());
        debug!(base = %config.base().display(), "store opened");
        Ok(Self {
            config,
            backend,
            index,
        })
    }

    #[must_use]
    pub fn base(&self) -> &Path {
        self.config.base()
    }

    /// Read the canonical (uncompressed) bytes stored under `key`.
    pub fn read_blob(&self, key: &str) -> Result<Vec<u8>> {
        self.backend.read(Namespace::Blob, key)
    }

    /// Write raw bytes directly under `key`, bypassing decompression and
    /// hashing. For callers that already hold canonical content and its key.
    pub fn write_blob_raw(&self, key: &str, reader: impl Read) -> Result<()> {
        self.backend.write(Namespace::Blob, key, reader)
    }

    /// Whether a value exists for `key` in the given namespace.
    #[must_use]
    pub fn contains(&self, namespace: Namespace, key: &str) -> bool {
        self.backend.contains(namespace, key)
    }

    /// Fetch and decode the manifest stored alongside the blob for `key`.
    pub fn get_manifest(&self, key: &str) -> Result<ImageManifest> {
        let raw = self.backend.read(Namespace::Manifest, key)?;
        ImageManifest::from_json(&raw).context("error decoding stored image manifest")
    }

    /// Resolve a partial key (`sha512-0c45e8...`) to the unique stored key
    /// it prefixes. Input longer than a full key is truncated first.
    ///
    /// # Errors
    ///
    /// [`StoreError::NoKeysFound`] when nothing matches;
    /// [`StoreError::AmbiguousKey`] as soon as a second match is seen; the
    /// scan stops there rather than walking the rest of the store.
    pub fn resolve_key(&self, key: &str) -> Result<String> {
        let prefix = key::normalize(key);
        let mut matches = self.backend.keys_with_prefix(Namespace::Blob, prefix);
        let Some(found) = matches.next() else {
            return Err(StoreError::NoKeysFound.into());
        };
        if matches.next().is_some() {
            return Err(StoreError::AmbiguousKey(prefix.to_string()).into());
        }
        Ok(found)
    }

    /// Look up the remote cached for `source_url`.
    pub fn get_remote(&self, source_url: &str) -> Result<Option<Remote>> {
        self.index.with_tx(|tx| index::get_remote(tx, source_url))
    }

    /// Insert or update the cached remote for its URL.
    pub fn put_remote(&self, remote: &Remote) -> Result<()> {
        self.index.with_tx(|tx| index::write_remote(tx, remote))
    }

    /// Every provenance row recorded by successful imports, oldest first.
    pub fn list_images(&self) -> Result<Vec<ImageInfo>> {
        self.index.with_tx(index::list_image_infos)
    }

    /// Print every key and a bounded value preview for each namespace,
    /// followed by a per-namespace key count.
    ///
    /// Debugging aid only. A key that enumerates but then fails to read
    /// back means the store is corrupt; this panics rather than continuing.
    pub fn dump(&self, hex_output: bool) {
        for namespace in [Namespace::Blob, Namespace::Manifest] {
            let dir = self.config.namespace_dir(namespace);
            let mut key_count = 0usize;
            for key in self.backend.keys(namespace) {
                let value = match self.backend.read(namespace, &key) {
                    Ok(value) => value,
                    Err(err) => {
                        panic!("key {key} in {} had no value: {err}", namespace.as_str())
                    }
                };
                let head = &value[..value.len().min(128)];
                let preview = if hex_output {
                    hex::encode(head)
                } else {
                    String::from_utf8_lossy(head).into_owned()
                };
                println!("{}/{key}: {preview}", dir.display());
                key_count += 1;
            }
            println!("{key_count} total keys");
        }
    }
}

pub(crate) fn ensure_dir(path: &Path, mode: u32) -> Result<()> {
    fs::create_dir_all(path)
        .with_context(|| format!("failed to ensure store directory {}", path.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(mode))
            .with_context(|| format!("failed to set mode on {}", path.display()))?;
    }
    #[cfg(not(unix))]
    let _ = mode;
    Ok(())
}

#[cfg(test)]
mod tests;
