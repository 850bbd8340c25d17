use super::models::{FingerprintEntry, WeightBand};
use super::{shard_table, shard_table_sql, Database, DbError, FingerprintStore, Result};
use crate::jumps::JumpCode;
use rusqlite::{params, Row};

fn entry_from_row(row: &Row<'_>) -> rusqlite::Result<FingerprintEntry> {
    Ok(FingerprintEntry {
        track_row: row.get(0)?,
        weight: row.get(1)?,
        jump_code: row.get(2)?,
    })
}

impl Database {
    /// Shard table name, after checking the shard exists.
    fn checked_table(&self, shard: usize) -> Result<String> {
        if shard == 0 {
            return Err(DbError::NoSuchShard(shard));
        }
        if shard > self.known_shards.get() && shard > self.shard_count()? {
            return Err(DbError::NoSuchShard(shard));
        }
        Ok(shard_table(shard))
    }
}

impl FingerprintStore for Database {
    fn shard_count(&self) -> Result<usize> {
        let count: i64 = self
            .conn
            .query_row("SELECT count FROM shards LIMIT 1", [], |row| row.get(0))?;
        self.known_shards.set(count as usize);
        Ok(count as usize)
    }

    fn shard_rows(&self, shard: usize) -> Result<u64> {
        let table = self.checked_table(shard)?;
        let rows: i64 = self
            .conn
            .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))?;
        Ok(rows as u64)
    }

    fn add_shard(&mut self) -> Result<usize> {
        let next = self.shard_count()? + 1;
        let tx = self.conn.unchecked_transaction()?;
        tx.execute_batch(&shard_table_sql(next))?;
        tx.execute("UPDATE shards SET count = ?1", params![next as i64])?;
        tx.commit()?;
        self.known_shards.set(next);
        log::debug!("Opened shard {}", next);
        Ok(next)
    }

    fn tracks(&self) -> Result<Vec<(i64, String)>> {
        let mut stmt = self
            .conn
            .prepare("SELECT rowid, track_id FROM tracks ORDER BY rowid")?;
        let tracks = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(tracks)
    }

    /// Registers the track and writes all its rows in a single transaction.
    fn insert_track(
        &mut self,
        shard: usize,
        track_id: &str,
        entries: &[(JumpCode, f64)],
    ) -> Result<i64> {
        let table = self.checked_table(shard)?;
        let tx = self.conn.unchecked_transaction()?;

        let exists: bool = tx.query_row(
            "SELECT EXISTS(SELECT 1 FROM tracks WHERE track_id = ?1)",
            params![track_id],
            |row| row.get(0),
        )?;
        if exists {
            return Err(DbError::DuplicateTrack(track_id.to_string()));
        }

        tx.execute("INSERT INTO tracks (track_id) VALUES (?1)", params![track_id])?;
        let track_row = tx.last_insert_rowid();

        {
            let mut stmt = tx.prepare_cached(&format!(
                "INSERT INTO {table} (track_row, weight, jump_code) VALUES (?1, ?2, ?3)"
            ))?;
            for &(code, weight) in entries {
                stmt.execute(params![track_row, weight, code])?;
            }
        }

        tx.commit()?;
        Ok(track_row)
    }

    fn lookup_by_code(
        &self,
        shard: usize,
        code: JumpCode,
        band: WeightBand,
    ) -> Result<Vec<FingerprintEntry>> {
        let table = self.checked_table(shard)?;
        let mut stmt = self.conn.prepare_cached(&format!(
            "SELECT track_row, weight, jump_code FROM {table}
             WHERE jump_code = ?1 AND weight BETWEEN ?2 AND ?3"
        ))?;
        let entries = stmt
            .query_map(params![code, band.low, band.high], entry_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    fn lookup_by_track(&self, shard: usize, track_row: i64) -> Result<Vec<FingerprintEntry>> {
        let table = self.checked_table(shard)?;
        let mut stmt = self.conn.prepare_cached(&format!(
            "SELECT track_row, weight, jump_code FROM {table}
             WHERE track_row = ?1 ORDER BY rowid"
        ))?;
        let entries = stmt
            .query_map(params![track_row], entry_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    fn distinct_codes(&self, shard: usize) -> Result<Vec<JumpCode>> {
        let table = self.checked_table(shard)?;
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT DISTINCT jump_code FROM {table}"))?;
        let codes = stmt
            .query_map([], |row| row.get(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(codes)
    }

    /// Drop and recreate both lookup indexes on every shard.
    fn reindex(&mut self) -> Result<()> {
        let shards = self.shard_count()?;
        let tx = self.conn.unchecked_transaction()?;
        for shard in 1..=shards {
            let table = shard_table(shard);
            tx.execute_batch(&format!(
                "
                DROP INDEX IF EXISTS idx_{table}_code_weight;
                CREATE INDEX idx_{table}_code_weight ON {table}(jump_code, weight);
                DROP INDEX IF EXISTS idx_{table}_track;
                CREATE INDEX idx_{table}_track ON {table}(track_row);
                "
            ))?;
            log::debug!("Reindexed {}", table);
        }
        tx.commit()?;
        Ok(())
    }
}
