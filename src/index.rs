//! Sharded inverted index: jump code → (track row, weight).
//!
//! [`FingerprintIndex`] wraps a [`FingerprintStore`] and keeps two caches
//! next to it: the track registry (both directions) and the set of every code
//! stored in any shard. Writes go through an [`IndexWriter`], which owns the
//! notion of the active shard and rolls over to a fresh one when the active
//! shard grows past the configured ceiling.

use std::collections::{BTreeMap, HashMap, HashSet};

use thiserror::Error;

use crate::db::models::{FingerprintEntry, IndexStats, WeightBand};
use crate::db::{DbError, FingerprintStore};
use crate::jumps::JumpCode;

/// Default per-shard row ceiling.
pub const DEFAULT_SHARD_CEILING: u64 = 10_000_000;

#[derive(Error, Debug)]
pub enum IndexError {
    #[error("Storage error: {0}")]
    Db(#[from] DbError),
}

pub type Result<T> = std::result::Result<T, IndexError>;

/// What happened to one track handed to [`IndexWriter::insert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// Stored under `row` with `codes` distinct codes.
    Indexed { row: i64, codes: usize },
    /// The fingerprint was empty.
    NoFingerprint,
    /// A single code occurrence: log10(1) = 0 would make its weight infinite.
    DegenerateWeights,
    /// The track id was already registered; nothing written.
    AlreadyIndexed,
}

/// Histogram `codes` into (code, weight) pairs, ascending by code.
///
/// With `normalize`, each count is divided by log10 of the total number of
/// occurrences. Returns `None` when that total is 1 and normalization is on.
/// An empty input gives an empty histogram.
pub fn weigh_codes(codes: &[JumpCode], normalize: bool) -> Option<Vec<(JumpCode, f64)>> {
    let mut counts: BTreeMap<JumpCode, u32> = BTreeMap::new();
    for &code in codes {
        *counts.entry(code).or_default() += 1;
    }

    let norm = if normalize && !codes.is_empty() {
        let total = (codes.len() as f64).log10();
        if total == 0.0 {
            return None;
        }
        total
    } else {
        1.0
    };

    Some(
        counts
            .into_iter()
            .map(|(code, n)| (code, n as f64 / norm))
            .collect(),
    )
}

pub struct FingerprintIndex<S> {
    store: S,
    names: BTreeMap<i64, String>,
    rows: HashMap<String, i64>,
    known_codes: HashSet<JumpCode>,
    shards: usize,
    shard_ceiling: u64,
}

impl<S: FingerprintStore> FingerprintIndex<S> {
    /// Wrap `store` and load the registry and known-code caches.
    pub fn open(store: S, shard_ceiling: u64) -> Result<Self> {
        let mut names = BTreeMap::new();
        let mut rows = HashMap::new();
        for (row, id) in store.tracks()? {
            rows.insert(id.clone(), row);
            names.insert(row, id);
        }

        let shards = store.shard_count()?;
        let mut known_codes = HashSet::new();
        for shard in 1..=shards {
            known_codes.extend(store.distinct_codes(shard)?);
        }

        log::debug!(
            "Opened index: {} tracks, {} known codes, ceiling {}",
            names.len(),
            known_codes.len(),
            shard_ceiling
        );

        Ok(Self {
            store,
            names,
            rows,
            known_codes,
            shards,
            shard_ceiling,
        })
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn into_store(self) -> S {
        self.store
    }

    pub fn shard_ceiling(&self) -> u64 {
        self.shard_ceiling
    }

    pub fn track_row(&self, track_id: &str) -> Option<i64> {
        self.rows.get(track_id).copied()
    }

    pub fn track_id(&self, row: i64) -> Option<&str> {
        self.names.get(&row).map(String::as_str)
    }

    pub fn track_count(&self) -> usize {
        self.names.len()
    }

    /// Registered track ids by ascending row id.
    pub fn track_ids(&self) -> impl Iterator<Item = &str> {
        self.names.values().map(String::as_str)
    }

    pub fn knows_code(&self, code: JumpCode) -> bool {
        self.known_codes.contains(&code)
    }

    pub fn shard_count(&self) -> usize {
        self.shards
    }

    /// Entries with `code` and a weight in `band`, from every shard.
    pub fn lookup(&self, code: JumpCode, band: WeightBand) -> Result<Vec<FingerprintEntry>> {
        let mut hits = Vec::new();
        for shard in 1..=self.shards {
            hits.extend(self.store.lookup_by_code(shard, code, band)?);
        }
        Ok(hits)
    }

    /// Stored (code, weight) pairs of one track, gathered across shards.
    pub fn codes_for_track(&self, row: i64) -> Result<Vec<(JumpCode, f64)>> {
        let mut codes = Vec::new();
        for shard in 1..=self.shards {
            codes.extend(
                self.store
                    .lookup_by_track(shard, row)?
                    .into_iter()
                    .map(|e| (e.jump_code, e.weight)),
            );
        }
        Ok(codes)
    }

    pub fn writer(&mut self) -> Result<IndexWriter<'_, S>> {
        let active = self.shards;
        let active_rows = self.store.shard_rows(active)?;
        Ok(IndexWriter {
            index: self,
            active,
            active_rows,
        })
    }

    /// Rebuild every shard's lookups. Safe to call repeatedly.
    pub fn reindex(&mut self) -> Result<()> {
        self.store.reindex()?;
        Ok(())
    }

    pub fn stats(&self) -> Result<IndexStats> {
        let shards = self.shards;
        let mut entries = 0;
        for shard in 1..=shards {
            entries += self.store.shard_rows(shard)?;
        }
        Ok(IndexStats {
            shards,
            entries,
            tracks: self.names.len() as u64,
            distinct_codes: self.known_codes.len() as u64,
        })
    }

    /// Copy every track of `other` into this index, in `other`'s row order.
    /// Row ids are reassigned; tracks already present here are skipped.
    /// Returns the number of tracks copied.
    pub fn merge_from<T: FingerprintStore>(&mut self, other: &FingerprintIndex<T>) -> Result<usize> {
        let mut writer = self.writer()?;
        let mut merged = 0;
        for (&row, id) in &other.names {
            let codes = other.codes_for_track(row)?;
            match writer.insert_weighted(id, &codes)? {
                InsertOutcome::Indexed { .. } => merged += 1,
                InsertOutcome::AlreadyIndexed => {
                    log::warn!("Skipping {}: already in destination index", id);
                }
                _ => {}
            }
        }
        Ok(merged)
    }
}

/// Appends tracks to the index, one shard at a time.
pub struct IndexWriter<'a, S> {
    index: &'a mut FingerprintIndex<S>,
    active: usize,
    active_rows: u64,
}

impl<S: FingerprintStore> IndexWriter<'_, S> {
    pub fn active_shard(&self) -> usize {
        self.active
    }

    /// Histogram `codes`, then store one row per distinct code.
    pub fn insert(
        &mut self,
        track_id: &str,
        codes: &[JumpCode],
        normalize: bool,
    ) -> Result<InsertOutcome> {
        if self.index.rows.contains_key(track_id) {
            return Ok(InsertOutcome::AlreadyIndexed);
        }
        if codes.is_empty() {
            log::debug!("{}: no fingerprint", track_id);
            return Ok(InsertOutcome::NoFingerprint);
        }
        let Some(weighted) = weigh_codes(codes, normalize) else {
            log::warn!("{}: a single code occurrence cannot be normalized, skipping", track_id);
            return Ok(InsertOutcome::DegenerateWeights);
        };
        self.insert_weighted(track_id, &weighted)
    }

    /// Store already weighted (code, weight) pairs. Codes must be distinct.
    pub fn insert_weighted(
        &mut self,
        track_id: &str,
        entries: &[(JumpCode, f64)],
    ) -> Result<InsertOutcome> {
        if self.index.rows.contains_key(track_id) {
            return Ok(InsertOutcome::AlreadyIndexed);
        }
        if entries.is_empty() {
            return Ok(InsertOutcome::NoFingerprint);
        }

        // Roll over before writing so a track never straddles shards.
        if self.active_rows > self.index.shard_ceiling {
            self.active = self.index.store.add_shard()?;
            self.index.shards = self.active;
            self.active_rows = 0;
            log::info!("Shard ceiling reached, writing to shard {}", self.active);
        }

        let row = self.index.store.insert_track(self.active, track_id, entries)?;
        self.active_rows += entries.len() as u64;

        let index = &mut *self.index;
        index.rows.insert(track_id.to_string(), row);
        index.names.insert(row, track_id.to_string());
        index.known_codes.extend(entries.iter().map(|&(code, _)| code));

        log::debug!("{}: {} codes into shard {} as row {}", track_id, entries.len(), self.active, row);
        Ok(InsertOutcome::Indexed { row, codes: entries.len() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory::MemoryStore;
    use crate::db::Database;

    fn memory_index(ceiling: u64) -> FingerprintIndex<MemoryStore> {
        FingerprintIndex::open(MemoryStore::new(), ceiling).unwrap()
    }

    #[test]
    fn test_weigh_codes_histogram() {
        let w = weigh_codes(&[5, 3, 5, 5, 3, 9, 5, 5, 5, 5], false).unwrap();
        assert_eq!(w, vec![(3, 2.0), (5, 7.0), (9, 1.0)]);
    }

    #[test]
    fn test_weigh_codes_normalizes_by_log_total() {
        // 10 occurrences: log10(10) = 1
        let w = weigh_codes(&[5, 3, 5, 5, 3, 9, 5, 5, 5, 5], true).unwrap();
        assert_eq!(w, vec![(3, 2.0), (5, 7.0), (9, 1.0)]);

        // 100 occurrences: log10(100) = 2
        let codes: Vec<JumpCode> = (0..100).map(|i| i % 4).collect();
        let w = weigh_codes(&codes, true).unwrap();
        assert!(w.iter().all(|&(_, weight)| (weight - 12.5).abs() < 1e-12));
    }

    #[test]
    fn test_weigh_codes_degenerate() {
        assert_eq!(weigh_codes(&[42], true), None);
        assert_eq!(weigh_codes(&[42], false), Some(vec![(42, 1.0)]));
        assert_eq!(weigh_codes(&[], true), Some(vec![]));
    }

    #[test]
    fn test_insert_outcomes() {
        let mut index = memory_index(DEFAULT_SHARD_CEILING);
        let mut w = index.writer().unwrap();
        assert_eq!(
            w.insert("TRA", &[1, 2, 2, 3], true).unwrap(),
            InsertOutcome::Indexed { row: 1, codes: 3 }
        );
        assert_eq!(w.insert("TRA", &[7, 8], true).unwrap(), InsertOutcome::AlreadyIndexed);
        assert_eq!(w.insert("TRB", &[], true).unwrap(), InsertOutcome::NoFingerprint);
        assert_eq!(w.insert("TRC", &[7], true).unwrap(), InsertOutcome::DegenerateWeights);

        assert_eq!(index.track_count(), 1);
        assert_eq!(index.track_row("TRA"), Some(1));
        assert_eq!(index.track_id(1), Some("TRA"));
        assert!(index.knows_code(2));
        assert!(!index.knows_code(7));
    }

    #[test]
    fn test_one_row_per_distinct_code() {
        let mut index = memory_index(DEFAULT_SHARD_CEILING);
        index.writer().unwrap().insert("TRA", &[4, 4, 4, 8, 8, 15], false).unwrap();
        let mut codes = index.codes_for_track(1).unwrap();
        codes.sort_by_key(|&(c, _)| c);
        assert_eq!(codes, vec![(4, 3.0), (8, 2.0), (15, 1.0)]);
    }

    #[test]
    fn test_shard_rollover_checks_before_write() {
        let mut index = memory_index(2);
        {
            let mut w = index.writer().unwrap();
            // 3 rows: shard 1 now exceeds the ceiling but the track stays whole.
            w.insert("TRA", &[1, 2, 3], false).unwrap();
            assert_eq!(w.active_shard(), 1);
            w.insert("TRB", &[1, 2], false).unwrap();
            assert_eq!(w.active_shard(), 2);
            // 2 rows is not more than the ceiling, so TRC shares shard 2.
            w.insert("TRC", &[5], false).unwrap();
            assert_eq!(w.active_shard(), 2);
        }
        let stats = index.stats().unwrap();
        assert_eq!(stats.shards, 2);
        assert_eq!(stats.entries, 6);
        assert_eq!(stats.tracks, 3);
        assert_eq!(stats.distinct_codes, 4);
        assert_eq!(index.store().shard_rows(1).unwrap(), 3);
        assert_eq!(index.lookup(1, WeightBand::around(1.0, 0.0)).unwrap().len(), 2);
    }

    #[test]
    fn test_writer_resumes_on_last_shard() {
        let mut index = memory_index(0);
        {
            let mut w = index.writer().unwrap();
            w.insert("TRA", &[1, 2], false).unwrap();
            w.insert("TRB", &[1, 2], false).unwrap();
        }
        let w = index.writer().unwrap();
        assert_eq!(w.active_shard(), 2);
    }

    #[test]
    fn test_reopen_restores_caches() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.db");
        {
            let mut index = FingerprintIndex::open(Database::open(&path).unwrap(), 1).unwrap();
            let mut w = index.writer().unwrap();
            w.insert("TRA", &[10, 20, 20], true).unwrap();
            w.insert("TRB", &[30, 40], true).unwrap();
        }
        let index = FingerprintIndex::open(Database::open(&path).unwrap(), 1).unwrap();
        assert_eq!(index.track_ids().collect::<Vec<_>>(), vec!["TRA", "TRB"]);
        assert!(index.knows_code(40));
        assert_eq!(index.shard_count(), 2);
    }

    #[test]
    fn test_rollover_updates_cached_shard_count() {
        let mut index = memory_index(0);
        {
            let mut w = index.writer().unwrap();
            w.insert("TRA", &[10, 20, 20], true).unwrap();
            w.insert("TRB", &[10, 30], true).unwrap();
            w.insert("TRC", &[10, 10, 40], true).unwrap();
        }
        assert_eq!(index.shard_count(), 3);
        assert_eq!(index.store().shard_count().unwrap(), 3);
        let rows: Vec<i64> = index
            .lookup(10, WeightBand { low: 0.0, high: f64::MAX })
            .unwrap()
            .iter()
            .map(|e| e.track_row)
            .collect();
        assert_eq!(rows, vec![1, 2, 3]);
        assert_eq!(index.codes_for_track(3).unwrap().len(), 2);
    }

    #[test]
    fn test_merge_reassigns_rows() {
        let mut a = memory_index(DEFAULT_SHARD_CEILING);
        a.writer().unwrap().insert("TRA", &[1, 2, 2], true).unwrap();

        let mut b = memory_index(DEFAULT_SHARD_CEILING);
        {
            let mut w = b.writer().unwrap();
            w.insert("TRB", &[3, 4], true).unwrap();
            w.insert("TRA", &[9, 9], true).unwrap();
        }

        assert_eq!(a.merge_from(&b).unwrap(), 1);
        assert_eq!(a.track_row("TRB"), Some(2));
        assert_eq!(a.codes_for_track(2).unwrap(), b.codes_for_track(1).unwrap());
        // Original TRA kept, duplicate skipped
        assert!(!a.knows_code(9));
    }
}
