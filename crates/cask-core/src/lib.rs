#![deny(clippy::all, warnings)]
#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::must_use_candidate
)]

//! Content-addressable storage for immutable container-image archives.
//!
//! An import accepts an archive in any supported compression, normalizes it
//! to its uncompressed tar form, hashes that canonical form with sha512
//! while streaming it to disk, and commits blob, manifest, and a provenance
//! row under a digest-derived key. Identical content always lands under the
//! same key regardless of how it was compressed on the way in.

pub mod config;
pub mod key;
mod store;

pub use config::StoreConfig;
pub use store::{ImageInfo, Namespace, Remote, Store, StoreError, SCHEMA_VERSION};

pub use cask_domain::{Dependency, FileType, ImageManifest, ManifestError};
