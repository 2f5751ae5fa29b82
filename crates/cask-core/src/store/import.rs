//! Streaming import pipeline.
//!
//! An archive arrives in any supported compression, gets normalized to its
//! uncompressed tar form, and is hashed while it streams to scratch space
//! in a single pass with no full in-memory buffering. Commit order is
//! fixed: blob, then manifest, then index row, so a partial failure always
//! leaves the content durable even when the metadata is incomplete, never
//! the reverse.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use bzip2::read::BzDecoder;
use flate2::read::GzDecoder;
use sha2::{Digest, Sha512};
use tracing::debug;

use cask_domain::{FileType, ImageManifest, HEADER_PEEK_LEN};

use crate::key;
use crate::store::index::{write_image_info, ImageInfo};
use crate::store::{ensure_dir, Namespace, Store, StoreError};

impl Store {
    /// Import a possibly-compressed image archive and return the key it was
    /// stored under.
    ///
    /// The key is derived from the sha512 of the uncompressed content, so
    /// identical content yields identical keys regardless of compression
    /// wrapper. A different archive whose truncated digest collides with an
    /// existing key overwrites that key unconditionally; no content
    /// comparison is performed.
    ///
    /// # Errors
    ///
    /// Failures before the blob lands store nothing, though the scratch file
    /// stays behind in `<base>/tmp` for external cleanup. Failures after the
    /// blob lands surface as [`StoreError::PartialImport`]: the content is
    /// durable, and re-running the whole import is the supported recovery.
    pub fn import_archive(&self, mut reader: impl Read) -> Result<String> {
        // Peek a bounded prefix for detection without losing any bytes; the
        // peeked slice is chained back in front of the remaining stream.
        let mut header = [0u8; HEADER_PEEK_LEN];
        let mut filled = 0;
        while filled < header.len() {
            let n = reader
                .read(&mut header[filled..])
                .context("error reading image header")?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        let kind = FileType::detect(&header[..filled]);
        let rest = io::Cursor::new(header[..filled].to_vec()).chain(reader);
        let mut decompressed = decompress(rest, kind)?;

        let (mut scratch, scratch_path) = self.scratch_file()?;
        let mut sink = HashingWriter::new(&mut scratch);
        io::copy(&mut decompressed, &mut sink).context("error copying image")?;
        let digest = sink.finish();

        scratch.sync_all().context("error flushing image")?;
        scratch
            .seek(SeekFrom::Start(0))
            .context("error rewinding image")?;
        let manifest =
            ImageManifest::from_tar(&mut scratch).context("error extracting image manifest")?;
        // The backend takes the scratch file by path; release the handle.
        drop(scratch);

        let blob_key = key::digest_to_key(&digest);
        self.backend
            .import_file(Namespace::Blob, &blob_key, &scratch_path)
            .context("error importing image")?;

        // Content is durable from here on. Anything failing below leaves a
        // blob without matching metadata, which re-importing repairs.
        self.write_manifest(&blob_key, &manifest).map_err(|err| {
            err.context(StoreError::PartialImport {
                key: blob_key.clone(),
                stage: "image manifest",
            })
        })?;

        let info = ImageInfo {
            blob_key: blob_key.clone(),
            app_name: manifest.name.clone(),
            import_time: unix_now(),
        };
        self.index
            .with_tx(|tx| write_image_info(tx, &info))
            .map_err(|err| {
                err.context(StoreError::PartialImport {
                    key: blob_key.clone(),
                    stage: "image info",
                })
            })?;

        debug!(key = %blob_key, app = %manifest.name, "image imported");
        Ok(blob_key)
    }

    fn write_manifest(&self, key: &str, manifest: &ImageManifest) -> Result<()> {
        let encoded = serde_json::to_vec(manifest).context("error encoding image manifest")?;
        self.backend
            .write(Namespace::Manifest, key, encoded.as_slice())
    }

    fn scratch_file(&self) -> Result<(File, PathBuf)> {
        let dir = self.config.tmp_dir();
        ensure_dir(&dir, self.config.mode())?;
        // Persisted immediately: failed imports leave their scratch file
        // behind for external cleanup instead of racing a Drop-time delete.
        let (file, path) = tempfile::Builder::new()
            .prefix("import-")
            .tempfile_in(&dir)
            .context("error creating scratch file")?
            .keep()
            .context("error persisting scratch file")?;
        Ok((file, path))
    }
}

fn decompress<'a, R: Read + 'a>(reader: R, kind: FileType) -> Result<Box<dyn Read + 'a>> {
    match kind {
        FileType::Gzip => Ok(Box::new(GzDecoder::new(reader))),
        FileType::Bzip2 => Ok(Box::new(BzDecoder::new(reader))),
        FileType::Tar => Ok(Box::new(reader)),
        FileType::Xz => Err(StoreError::UnsupportedCompression(kind)).context("error decompressing image"),
        FileType::Unknown => Err(StoreError::UnknownArchiveType).context("error detecting image type"),
    }
}

/// Byte sink that forwards every write to the inner writer and a running
/// sha512, exposing the digest only once the source is fully drained.
struct HashingWriter<W> {
    inner: W,
    digest: Sha512,
}

impl<W: Write> HashingWriter<W> {
    fn new(inner: W) -> Self {
        Self {
            inner,
            digest: Sha512::new(),
        }
    }

    fn finish(self) -> Vec<u8> {
        self.digest.finalize().to_vec()
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = self.inner.write(buf)?;
        self.digest.update(&buf[..written]);
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0) as i64
}
