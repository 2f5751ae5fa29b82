//! Transactional metadata index.
//!
//! Sqlite-backed record store holding import provenance and the remote-URL
//! cache, guarded by a schema version written once at first initialization
//! and checked on every open. Everything runs through [`Index::with_tx`]:
//! one immediate transaction per unit of work, committed on success and
//! rolled back on any error.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, OptionalExtension, Transaction, TransactionBehavior};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::store::StoreError;

/// Schema generation this build reads and writes. Stores carrying any other
/// version are rejected at open; there is no migration path.
pub const SCHEMA_VERSION: i64 = 1;

const INDEX_FILENAME: &str = "index.sqlite";
const META_KEY_SCHEMA_VERSION: &str = "schema_version";

const CREATE_STMTS: &str = "
    CREATE TABLE meta (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    );
    CREATE TABLE images (
        blob_key TEXT NOT NULL,
        app_name TEXT NOT NULL,
        import_time INTEGER NOT NULL
    );
    CREATE TABLE remotes (
        source_url TEXT PRIMARY KEY,
        blob_key TEXT NOT NULL
    );
";

/// Provenance row written once per successful import. Never mutated.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageInfo {
    pub blob_key: String,
    pub app_name: String,
    /// Unix seconds at import time.
    pub import_time: i64,
}

/// Cache row mapping an external fetch URL to the key it last resolved to.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Remote {
    pub source_url: String,
    pub blob_key: String,
}

#[derive(Clone, Debug)]
pub(crate) struct Index {
    path: PathBuf,
}

impl Index {
    /// Open the index, creating the schema on first use and enforcing the
    /// stored schema version before anything else can touch it.
    pub fn open(dir: &Path) -> Result<Self> {
        let index = Self {
            path: dir.join(INDEX_FILENAME),
        };
        index.with_tx(|tx| {
            if !is_populated(tx)? {
                tx.execute_batch(CREATE_STMTS)
                    .context("failed to create index schema")?;
                tx.execute(
                    "INSERT INTO meta(key, value) VALUES (?1, ?2)",
                    params![META_KEY_SCHEMA_VERSION, SCHEMA_VERSION.to_string()],
                )
                .context("failed to seed index schema version")?;
                debug!(path = %index.path.display(), "metadata index created");
            }
            let found = schema_version(tx)?;
            if found < SCHEMA_VERSION {
                return Err(StoreError::SchemaTooOld {
                    found,
                    expected: SCHEMA_VERSION,
                }
                .into());
            }
            if found > SCHEMA_VERSION {
                return Err(StoreError::SchemaTooNew {
                    found,
                    expected: SCHEMA_VERSION,
                }
                .into());
            }
            Ok(())
        })?;
        Ok(index)
    }

    /// Run `work` inside one immediate transaction, committing on success.
    /// Any error return rolls back every write the closure made, with no
    /// partial visibility to other transactions mid-flight.
    pub fn with_tx<T, F>(&self, work: F) -> Result<T>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T>,
    {
        let mut conn = self.connection()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start index transaction")?;
        let result = work(&tx)?;
        tx.commit().context("failed to commit index transaction")?;
        Ok(result)
    }

    fn connection(&self) -> Result<Connection> {
        let conn = Connection::open(&self.path)
            .with_context(|| format!("failed to open index at {}", self.path.display()))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .context("failed to enable WAL for index")?;
        conn.pragma_update(None, "foreign_keys", "ON")
            .context("failed to enable foreign keys for index")?;
        conn.busy_timeout(Duration::from_secs(10))
            .context("failed to set busy timeout for index")?;
        Ok(conn)
    }
}

fn is_populated(tx: &Transaction<'_>) -> Result<bool> {
    let tables: i64 = tx
        .query_row(
            "SELECT count(*) FROM sqlite_master WHERE type = 'table' AND name = 'meta'",
            [],
            |row| row.get(0),
        )
        .context("failed to probe index tables")?;
    Ok(tables > 0)
}

fn schema_version(tx: &Transaction<'_>) -> Result<i64> {
    let value: String = tx
        .query_row(
            "SELECT value FROM meta WHERE key = ?1",
            params![META_KEY_SCHEMA_VERSION],
            |row| row.get(0),
        )
        .optional()
        .context("failed to read index schema version")?
        .ok_or_else(|| anyhow!("index is missing its schema version row"))?;
    value
        .parse::<i64>()
        .with_context(|| format!("index schema version {value:?} is not an integer"))
}

pub(crate) fn write_image_info(tx: &Transaction<'_>, info: &ImageInfo) -> Result<()> {
    tx.execute(
        "INSERT INTO images(blob_key, app_name, import_time) VALUES (?1, ?2, ?3)",
        params![info.blob_key, info.app_name, info.import_time],
    )
    .context("failed to write image info")?;
    Ok(())
}

pub(crate) fn list_image_infos(tx: &Transaction<'_>) -> Result<Vec<ImageInfo>> {
    let mut stmt = tx.prepare(
        "SELECT blob_key, app_name, import_time FROM images \
         ORDER BY import_time ASC, blob_key ASC",
    )?;
    let mut rows = stmt.query([])?;
    let mut infos = Vec::new();
    while let Some(row) = rows.next()? {
        infos.push(ImageInfo {
            blob_key: row.get(0)?,
            app_name: row.get(1)?,
            import_time: row.get(2)?,
        });
    }
    Ok(infos)
}

pub(crate) fn get_remote(tx: &Transaction<'_>, source_url: &str) -> Result<Option<Remote>> {
    tx.query_row(
        "SELECT source_url, blob_key FROM remotes WHERE source_url = ?1",
        params![source_url],
        |row| {
            Ok(Remote {
                source_url: row.get(0)?,
                blob_key: row.get(1)?,
            })
        },
    )
    .optional()
    .context("failed to look up remote")
}

pub(crate) fn write_remote(tx: &Transaction<'_>, remote: &Remote) -> Result<()> {
    tx.execute(
        "INSERT INTO remotes(source_url, blob_key) VALUES (?1, ?2) \
         ON CONFLICT(source_url) DO UPDATE SET blob_key=excluded.blob_key",
        params![remote.source_url, remote.blob_key],
    )
    .context("failed to write remote")?;
    Ok(())
}
