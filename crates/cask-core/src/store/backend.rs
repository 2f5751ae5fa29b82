//! On-disk key-value backend for the store's namespaces.
//!
//! Values commit by writing to a uniquely named sibling temp file and
//! renaming it into place, so readers only ever observe complete values and
//! concurrent writers of identical content race benignly (last rename wins,
//! never a torn file).

use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::warn;
use walkdir::WalkDir;

use crate::config::StoreConfig;
use crate::key::HASH_PREFIX;
use crate::store::{ensure_dir, StoreError};

const TMP_SUFFIX: &str = ".tmp";

/// Independent key-value partitions sharing one keyspace.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Namespace {
    Blob,
    Manifest,
}

impl Namespace {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Blob => "blob",
            Self::Manifest => "imageManifest",
        }
    }
}

#[derive(Clone, Debug)]
pub(crate) struct DiskStore {
    config: StoreConfig,
}

impl DiskStore {
    pub fn new(config: StoreConfig) -> Self {
        Self { config }
    }

    fn value_path(&self, namespace: Namespace, key: &str) -> PathBuf {
        let (first, second) = shard(key);
        self.config
            .namespace_dir(namespace)
            .join(first)
            .join(second)
            .join(key)
    }

    pub fn contains(&self, namespace: Namespace, key: &str) -> bool {
        self.value_path(namespace, key).is_file()
    }

    pub fn read(&self, namespace: Namespace, key: &str) -> Result<Vec<u8>> {
        let path = self.value_path(namespace, key);
        if !path.is_file() {
            return Err(StoreError::MissingKey {
                namespace: namespace.as_str(),
                key: key.to_string(),
            }
            .into());
        }
        fs::read(&path).with_context(|| {
            format!(
                "failed to read {} value at {}",
                namespace.as_str(),
                path.display()
            )
        })
    }

    /// Atomically write a value under `key`, replacing any existing one.
    pub fn write(&self, namespace: Namespace, key: &str, mut value: impl Read) -> Result<()> {
        let path = self.value_path(namespace, key);
        self.prepare_parent(&path)?;
        let tmp = sibling_tmp_path(&path);
        let mut file = File::create(&tmp)
            .with_context(|| format!("failed to create temp value {}", tmp.display()))?;
        if let Err(err) = io::copy(&mut value, &mut file) {
            let _ = fs::remove_file(&tmp);
            return Err(err)
                .with_context(|| format!("failed to write {} value for {key}", namespace.as_str()));
        }
        file.sync_all()
            .with_context(|| format!("failed to flush temp value {}", tmp.display()))?;
        drop(file);
        fs::rename(&tmp, &path).with_context(|| {
            format!(
                "failed to move value into place ({} -> {})",
                tmp.display(),
                path.display()
            )
        })?;
        if let Some(parent) = path.parent() {
            fsync_dir(parent).ok();
        }
        Ok(())
    }

    /// Move a file already on disk into the namespace under `key`.
    ///
    /// Rename is tried first; when the source sits on another filesystem the
    /// contents are copied through the atomic write path instead.
    pub fn import_file(&self, namespace: Namespace, key: &str, source: &Path) -> Result<()> {
        let dest = self.value_path(namespace, key);
        self.prepare_parent(&dest)?;
        if fs::rename(source, &dest).is_err() {
            let reader = File::open(source)
                .with_context(|| format!("failed to open import source {}", source.display()))?;
            self.write(namespace, key, reader)?;
            let _ = fs::remove_file(source);
        }
        if let Some(parent) = dest.parent() {
            fsync_dir(parent).ok();
        }
        Ok(())
    }

    /// Lazily enumerate every key in a namespace, lexically ordered.
    pub fn keys(&self, namespace: Namespace) -> Box<dyn Iterator<Item = String>> {
        self.keys_with_prefix(namespace, "")
    }

    /// Lazily enumerate keys starting with `prefix`.
    ///
    /// The walk is pull-driven: the caller may stop consuming at any point
    /// and no further directory work happens. Unreadable entries are logged
    /// and skipped rather than aborting the scan.
    pub fn keys_with_prefix(
        &self,
        namespace: Namespace,
        prefix: &str,
    ) -> Box<dyn Iterator<Item = String>> {
        let root = self.config.namespace_dir(namespace);
        if !root.is_dir() {
            return Box::new(std::iter::empty());
        }
        let prefix = prefix.to_string();
        Box::new(
            WalkDir::new(root)
                .min_depth(3)
                .max_depth(3)
                .sort_by(|a, b| a.file_name().cmp(b.file_name()))
                .into_iter()
                .filter_map(|entry| match entry {
                    Ok(entry) => Some(entry),
                    Err(err) => {
                        warn!(%err, "skipping unreadable entry during key scan");
                        None
                    }
                })
                .filter(|entry| entry.file_type().is_file())
                .filter_map(|entry| entry.file_name().to_str().map(str::to_string))
                .filter(move |name| !name.ends_with(TMP_SUFFIX) && name.starts_with(&prefix)),
        )
    }

    fn prepare_parent(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            ensure_dir(parent, self.config.mode())?;
        }
        Ok(())
    }
}

/// Two-level fan-out over the hex portion of the key, so no directory ever
/// holds more than 256 children.
fn shard(key: &str) -> (&str, &str) {
    let hex = key.strip_prefix(HASH_PREFIX).unwrap_or(key);
    (
        hex.get(0..2).unwrap_or("xx"),
        hex.get(2..4).unwrap_or("xx"),
    )
}

fn sibling_tmp_path(path: &Path) -> PathBuf {
    let name = format!(
        "{}.{}.{:?}{TMP_SUFFIX}",
        path.file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default(),
        std::process::id(),
        std::thread::current().id()
    );
    path.with_file_name(name)
}

fn fsync_dir(dir: &Path) -> io::Result<()> {
    File::open(dir)?.sync_all()
}
