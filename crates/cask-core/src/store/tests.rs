use super::*;
use std::fs as stdfs;
use std::io::Cursor;
use std::io::Write as _;

use flate2::write::GzEncoder;
use flate2::Compression;
use serde_json::json;
use sha2::{Digest, Sha512};
use tempfile::tempdir;

use crate::key::{digest_to_key, HASH_PREFIX, LEN_HASH_KEY, LEN_KEY};

fn new_store() -> Result<(tempfile::TempDir, Store)> {
    let temp = tempdir()?;
    let store = Store::open(temp.path().join("store"))?;
    Ok((temp, store))
}

fn manifest_json(name: &str) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "name": name,
        "labels": { "version": "1.0.0", "arch": "amd64" },
    }))
    .unwrap()
}

fn tar_with(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for (path, data) in entries {
        let mut header = tar::Header::new_gnu();
        header.set_mode(0o644);
        header.set_size(data.len() as u64);
        builder.append_data(&mut header, path, *data).unwrap();
    }
    builder.into_inner().unwrap()
}

fn image_archive(name: &str) -> Vec<u8> {
    let manifest = manifest_json(name);
    tar_with(&[
        ("manifest", manifest.as_slice()),
        ("rootfs/bin/app", b"#!/bin/sh\nexit 0\n"),
    ])
}

fn gzip(bytes: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(bytes).unwrap();
    encoder.finish().unwrap()
}

fn bzip(bytes: &[u8]) -> Vec<u8> {
    let mut encoder = bzip2::write::BzEncoder::new(Vec::new(), bzip2::Compression::best());
    encoder.write_all(bytes).unwrap();
    encoder.finish().unwrap()
}

fn expected_key(canonical: &[u8]) -> String {
    digest_to_key(Sha512::digest(canonical).as_slice())
}

fn synthetic_key(lead: &str) -> String {
    assert!(lead.len() <= LEN_HASH_KEY);
    format!(
        "{HASH_PREFIX}{lead}{}",
        "0".repeat(LEN_HASH_KEY - lead.len())
    )
}

#[test]
fn import_is_deterministic_across_compression_wrappers() -> Result<()> {
    let (_temp, store) = new_store()?;
    let canonical = image_archive("example-app");

    let from_tar = store.import_archive(Cursor::new(canonical.clone()))?;
    let from_gzip = store.import_archive(Cursor::new(gzip(&canonical)))?;
    let from_bzip = store.import_archive(Cursor::new(bzip(&canonical)))?;

    assert_eq!(from_tar, expected_key(&canonical));
    assert_eq!(from_gzip, from_tar);
    assert_eq!(from_bzip, from_tar);
    Ok(())
}

#[test]
fn import_round_trips_blob_and_manifest() -> Result<()> {
    let (_temp, store) = new_store()?;
    let canonical = image_archive("example-app");

    let key = store.import_archive(Cursor::new(gzip(&canonical)))?;
    assert_eq!(key.len(), LEN_KEY);
    assert!(key.starts_with(HASH_PREFIX));

    // The stored blob is the canonical (uncompressed) form.
    assert_eq!(store.read_blob(&key)?, canonical);

    let manifest = store.get_manifest(&key)?;
    assert_eq!(manifest.name, "example-app");
    assert_eq!(manifest.labels["version"], "1.0.0");

    let images = store.list_images()?;
    assert_eq!(images.len(), 1);
    assert_eq!(images[0].blob_key, key);
    assert_eq!(images[0].app_name, "example-app");
    assert!(images[0].import_time > 0);
    Ok(())
}

#[test]
fn reimport_is_idempotent_for_content() -> Result<()> {
    let (_temp, store) = new_store()?;
    let canonical = image_archive("example-app");

    let first = store.import_archive(Cursor::new(canonical.clone()))?;
    let second = store.import_archive(Cursor::new(gzip(&canonical)))?;
    assert_eq!(first, second);

    // Exactly one blob and one manifest; the provenance log may carry a row
    // per import, but every row points at the same key.
    assert_eq!(store.read_blob(&first)?, canonical);
    assert_eq!(store.get_manifest(&first)?.name, "example-app");
    let images = store.list_images()?;
    assert!(!images.is_empty());
    assert!(images.iter().all(|info| info.blob_key == first));
    Ok(())
}

#[test]
fn resolve_key_classifies_zero_one_and_many_matches() -> Result<()> {
    let (_temp, store) = new_store()?;
    let first = synthetic_key("aaaa");
    let second = synthetic_key("aabb");
    store.write_blob_raw(&first, b"first".as_slice())?;
    store.write_blob_raw(&second, b"second".as_slice())?;

    let err = store.resolve_key("sha512-aa").unwrap_err();
    assert!(matches!(
        err.downcast_ref::<StoreError>(),
        Some(StoreError::AmbiguousKey(prefix)) if prefix.as_str() == "sha512-aa"
    ));

    assert_eq!(store.resolve_key("sha512-aaaa")?, first);
    assert_eq!(store.resolve_key(&second)?, second);

    let err = store.resolve_key("sha512-zz").unwrap_err();
    assert!(matches!(
        err.downcast_ref::<StoreError>(),
        Some(StoreError::NoKeysFound)
    ));
    Ok(())
}

#[test]
fn resolve_key_truncates_over_long_input() -> Result<()> {
    let (_temp, store) = new_store()?;
    let canonical = image_archive("example-app");
    let key = store.import_archive(Cursor::new(canonical))?;

    let padded = format!("{key}-extra-garbage");
    assert_eq!(store.resolve_key(&padded)?, key);
    Ok(())
}

#[test]
fn schema_version_mismatch_fails_open_in_both_directions() -> Result<()> {
    let temp = tempdir()?;
    let base = temp.path().join("store");
    drop(Store::open(&base)?);

    let index_path = base.join("cas").join("db").join("index.sqlite");
    let set_version = |version: &str| {
        let conn = rusqlite::Connection::open(&index_path).unwrap();
        conn.execute(
            "UPDATE meta SET value = ?1 WHERE key = 'schema_version'",
            rusqlite::params![version],
        )
        .unwrap();
    };

    set_version("0");
    let err = Store::open(&base).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<StoreError>(),
        Some(StoreError::SchemaTooOld {
            found: 0,
            expected: SCHEMA_VERSION
        })
    ));

    set_version("2");
    let err = Store::open(&base).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<StoreError>(),
        Some(StoreError::SchemaTooNew {
            found: 2,
            expected: SCHEMA_VERSION
        })
    ));

    set_version("1");
    assert!(Store::open(&base).is_ok());
    Ok(())
}

#[test]
fn archive_without_manifest_stores_nothing_but_leaves_scratch() -> Result<()> {
    let (_temp, store) = new_store()?;
    let canonical = tar_with(&[("rootfs/bin/app", b"#!".as_slice())]);

    let err = store.import_archive(Cursor::new(canonical.clone())).unwrap_err();
    assert!(err.to_string().contains("error extracting image manifest"));

    // Nothing landed in any namespace or the index...
    assert!(!store.contains(Namespace::Blob, &expected_key(&canonical)));
    assert!(store.list_images()?.is_empty());

    // ...but the scratch file is left for external cleanup.
    let scratch: Vec<_> = stdfs::read_dir(store.base().join("tmp"))?
        .filter_map(std::result::Result::ok)
        .collect();
    assert!(!scratch.is_empty());
    Ok(())
}

#[test]
fn unknown_and_unsupported_archives_are_classified() -> Result<()> {
    let (_temp, store) = new_store()?;

    let err = store
        .import_archive(Cursor::new(vec![0u8; 600]))
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<StoreError>(),
        Some(StoreError::UnknownArchiveType)
    ));

    // Empty input is a short peek, not a crash.
    let err = store.import_archive(Cursor::new(Vec::new())).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<StoreError>(),
        Some(StoreError::UnknownArchiveType)
    ));

    let mut xz_like = vec![0xfd, b'7', b'z', b'X', b'Z', 0x00];
    xz_like.extend_from_slice(&[0u8; 64]);
    let err = store.import_archive(Cursor::new(xz_like)).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<StoreError>(),
        Some(StoreError::UnsupportedCompression(FileType::Xz))
    ));
    Ok(())
}

#[test]
fn read_blob_for_absent_key_is_not_found() -> Result<()> {
    let (_temp, store) = new_store()?;
    let key = synthetic_key("dead");
    let err = store.read_blob(&key).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<StoreError>(),
        Some(StoreError::MissingKey { namespace: "blob", .. })
    ));

    let err = store.get_manifest(&key).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<StoreError>(),
        Some(StoreError::MissingKey { namespace: "imageManifest", .. })
    ));
    Ok(())
}

#[test]
fn write_blob_raw_bypasses_the_pipeline() -> Result<()> {
    let (_temp, store) = new_store()?;
    let key = synthetic_key("beef");
    store.write_blob_raw(&key, b"raw canonical bytes".as_slice())?;

    assert!(store.contains(Namespace::Blob, &key));
    assert!(!store.contains(Namespace::Manifest, &key));
    assert_eq!(store.read_blob(&key)?, b"raw canonical bytes");

    // Overwrite semantics: a second write replaces the value.
    store.write_blob_raw(&key, b"replaced".as_slice())?;
    assert_eq!(store.read_blob(&key)?, b"replaced");
    Ok(())
}

#[test]
fn remotes_are_upserted_and_looked_up_by_url() -> Result<()> {
    let (_temp, store) = new_store()?;
    let url = "https://images.example.com/app.aci";
    assert!(store.get_remote(url)?.is_none());

    let remote = Remote {
        source_url: url.to_string(),
        blob_key: synthetic_key("0123"),
    };
    store.put_remote(&remote)?;
    assert_eq!(store.get_remote(url)?, Some(remote.clone()));

    let updated = Remote {
        blob_key: synthetic_key("4567"),
        ..remote
    };
    store.put_remote(&updated)?;
    assert_eq!(store.get_remote(url)?, Some(updated));
    Ok(())
}

#[test]
fn dump_walks_every_namespace() -> Result<()> {
    let (_temp, store) = new_store()?;
    let canonical = image_archive("example-app");
    store.import_archive(Cursor::new(canonical))?;
    // Smoke: must not panic on a healthy store, in either render mode.
    store.dump(false);
    store.dump(true);
    Ok(())
}

#[test]
fn reopening_an_existing_store_preserves_content() -> Result<()> {
    let temp = tempdir()?;
    let base = temp.path().join("store");
    let canonical = image_archive("example-app");
    let key = {
        let store = Store::open(&base)?;
        store.import_archive(Cursor::new(canonical.clone()))?
    };

    let reopened = Store::open(&base)?;
    assert_eq!(reopened.read_blob(&key)?, canonical);
    assert_eq!(reopened.get_manifest(&key)?.name, "example-app");
    assert_eq!(reopened.resolve_key(&key[..12])?, key);
    Ok(())
}
