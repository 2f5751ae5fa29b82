//! Image manifest schema and extraction from canonical archives.

use std::collections::BTreeMap;
use std::io::{self, Read};
use std::path::Path;

use serde::{Deserialize, Serialize};

/// Path of the manifest entry inside a canonical image archive.
pub const MANIFEST_ENTRY: &str = "manifest";

/// Errors raised while pulling a manifest out of a canonical archive.
#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("archive has no {MANIFEST_ENTRY:?} entry")]
    Missing,
    #[error("manifest is not valid JSON: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("manifest has an empty name")]
    EmptyName,
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Structured metadata describing an image, carried inside its archive and
/// persisted alongside the blob under the same key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageManifest {
    pub name: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<Dependency>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

/// A named image this image layers on top of.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependency {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_id: Option<String>,
}

impl ImageManifest {
    /// Decode a manifest from raw JSON bytes, enforcing required fields.
    pub fn from_json(bytes: &[u8]) -> Result<Self, ManifestError> {
        let manifest: Self = serde_json::from_slice(bytes)?;
        if manifest.name.is_empty() {
            return Err(ManifestError::EmptyName);
        }
        Ok(manifest)
    }

    /// Scan a canonical tar stream for the manifest entry and decode it.
    ///
    /// The reader must be positioned at the start of the archive. Entries
    /// after the manifest are never read.
    pub fn from_tar<R: Read>(reader: R) -> Result<Self, ManifestError> {
        let mut archive = tar::Archive::new(reader);
        for entry in archive.entries()? {
            let mut entry = entry?;
            let is_manifest = match entry.path() {
                Ok(path) => {
                    let trimmed = path.strip_prefix(".").unwrap_or(path.as_ref());
                    trimmed == Path::new(MANIFEST_ENTRY)
                }
                Err(_) => false,
            };
            if !is_manifest {
                continue;
            }
            let mut raw = Vec::new();
            entry.read_to_end(&mut raw)?;
            return Self::from_json(&raw);
        }
        Err(ManifestError::Missing)
    }
}
