#![deny(clippy::all, warnings)]
#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::must_use_candidate
)]

//! Domain logic shared by the cask store: archive compression detection and
//! the image-manifest schema. Nothing in this crate touches store state.

pub mod archive;
pub mod manifest;

pub use archive::{FileType, HEADER_PEEK_LEN};
pub use manifest::{Dependency, ImageManifest, ManifestError, MANIFEST_ENTRY};
