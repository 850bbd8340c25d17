pub mod memory;
pub mod models;
pub mod queries;

use rusqlite::{Connection, OpenFlags};
use std::cell::Cell;
use std::path::Path;
use thiserror::Error;

use crate::jumps::JumpCode;
use models::{FingerprintEntry, WeightBand};

#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Migration failed: {0}")]
    Migration(String),
    #[error("No such shard: {0}")]
    NoSuchShard(usize),
    #[error("Track already registered: {0}")]
    DuplicateTrack(String),
}

pub type Result<T> = std::result::Result<T, DbError>;

/// Storage engine behind a fingerprint index.
///
/// Shards are numbered from 1; a fresh store has exactly one, empty shard.
/// Track row ids are assigned by the store in registration order.
pub trait FingerprintStore {
    fn shard_count(&self) -> Result<usize>;

    /// Entries currently stored in `shard`.
    fn shard_rows(&self, shard: usize) -> Result<u64>;

    /// Create the next shard and return its number.
    fn add_shard(&mut self) -> Result<usize>;

    /// Registry contents as (row id, track id), by ascending row id.
    fn tracks(&self) -> Result<Vec<(i64, String)>>;

    /// Register `track_id` and write its entries to `shard` atomically.
    /// Returns the new row id. Registering a known track id is an error.
    fn insert_track(
        &mut self,
        shard: usize,
        track_id: &str,
        entries: &[(JumpCode, f64)],
    ) -> Result<i64>;

    /// Entries in `shard` with this code and a weight inside `band`.
    fn lookup_by_code(
        &self,
        shard: usize,
        code: JumpCode,
        band: WeightBand,
    ) -> Result<Vec<FingerprintEntry>>;

    /// Entries in `shard` belonging to one track, in insertion order.
    fn lookup_by_track(&self, shard: usize, track_row: i64) -> Result<Vec<FingerprintEntry>>;

    /// Every distinct code in `shard`.
    fn distinct_codes(&self, shard: usize) -> Result<Vec<JumpCode>>;

    /// Rebuild the (code, weight) and track lookups of every shard.
    fn reindex(&mut self) -> Result<()>;
}

pub struct Database {
    pub conn: Connection,
    /// Highest shard number seen to exist. Shards are never dropped.
    known_shards: Cell<usize>,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let conn = Connection::open(path)?;
        let db = Self { conn, known_shards: Cell::new(0) };
        db.init()?;
        Ok(db)
    }

    /// Open an existing, already migrated database for querying only.
    pub fn open_read_only(path: &Path) -> Result<Self> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        let version: i32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
        if version < SCHEMA_VERSION {
            return Err(DbError::Migration(format!(
                "{} has schema version {version}, expected {SCHEMA_VERSION}",
                path.display()
            )));
        }
        Ok(Self { conn, known_shards: Cell::new(0) })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self { conn, known_shards: Cell::new(0) };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        // WAL mode for better concurrent read performance
        self.conn.pragma_update(None, "journal_mode", "WAL")?;
        self.conn.pragma_update(None, "synchronous", "NORMAL")?;
        self.migrate()?;
        Ok(())
    }

    fn migrate(&self) -> Result<()> {
        let version: i32 = self
            .conn
            .pragma_query_value(None, "user_version", |row| row.get(0))
            .unwrap_or(0);

        if version < 1 {
            self.migrate_v1()?;
        }

        self.conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
        Ok(())
    }

    /// V1: track registry, shard counter and the first hash shard.
    fn migrate_v1(&self) -> Result<()> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS tracks (
                track_id    TEXT PRIMARY KEY
            );

            CREATE TABLE IF NOT EXISTS shards (
                count       INTEGER NOT NULL
            );
            INSERT INTO shards (count) SELECT 1 WHERE NOT EXISTS (SELECT 1 FROM shards);
            ",
        )?;
        self.conn.execute_batch(&shard_table_sql(1))?;
        Ok(())
    }
}

const SCHEMA_VERSION: i32 = 1;

/// Name of the hash table backing `shard`.
fn shard_table(shard: usize) -> String {
    format!("hashes{shard}")
}

fn shard_table_sql(shard: usize) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {} (
            track_row   INTEGER NOT NULL,
            weight      REAL NOT NULL,
            jump_code   INTEGER NOT NULL
        );",
        shard_table(shard)
    )
}
