//! In-memory fingerprint store.
//!
//! Each shard keeps its raw rows in insertion order plus two optional ordered
//! lookups rebuilt by `reindex`. Until a shard has been reindexed (or after it
//! receives new rows) lookups fall back to a linear scan, so results never
//! depend on whether `reindex` ran.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use ordered_float::OrderedFloat;

use super::models::{FingerprintEntry, WeightBand};
use super::{DbError, FingerprintStore, Result};
use crate::jumps::JumpCode;

#[derive(Debug, Default)]
struct MemoryShard {
    entries: Vec<FingerprintEntry>,
    /// (code, weight, position in `entries`)
    by_code: Option<BTreeSet<(JumpCode, OrderedFloat<f64>, usize)>>,
    by_track: Option<BTreeMap<i64, Vec<usize>>>,
}

impl MemoryShard {
    fn rebuild(&mut self) {
        let mut by_code = BTreeSet::new();
        let mut by_track: BTreeMap<i64, Vec<usize>> = BTreeMap::new();
        for (i, e) in self.entries.iter().enumerate() {
            by_code.insert((e.jump_code, OrderedFloat(e.weight), i));
            by_track.entry(e.track_row).or_default().push(i);
        }
        self.by_code = Some(by_code);
        self.by_track = Some(by_track);
    }
}

/// B-tree backed store, used by ingest workers and tests.
#[derive(Debug)]
pub struct MemoryStore {
    tracks: Vec<String>,
    rows: HashMap<String, i64>,
    shards: Vec<MemoryShard>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            tracks: Vec::new(),
            rows: HashMap::new(),
            shards: vec![MemoryShard::default()],
        }
    }

    fn shard(&self, shard: usize) -> Result<&MemoryShard> {
        shard
            .checked_sub(1)
            .and_then(|i| self.shards.get(i))
            .ok_or(DbError::NoSuchShard(shard))
    }

    fn shard_mut(&mut self, shard: usize) -> Result<&mut MemoryShard> {
        shard
            .checked_sub(1)
            .and_then(|i| self.shards.get_mut(i))
            .ok_or(DbError::NoSuchShard(shard))
    }
}

impl FingerprintStore for MemoryStore {
    fn shard_count(&self) -> Result<usize> {
        Ok(self.shards.len())
    }

    fn shard_rows(&self, shard: usize) -> Result<u64> {
        Ok(self.shard(shard)?.entries.len() as u64)
    }

    fn add_shard(&mut self) -> Result<usize> {
        self.shards.push(MemoryShard::default());
        Ok(self.shards.len())
    }

    fn tracks(&self) -> Result<Vec<(i64, String)>> {
        Ok(self
            .tracks
            .iter()
            .enumerate()
            .map(|(i, id)| (i as i64 + 1, id.clone()))
            .collect())
    }

    fn insert_track(
        &mut self,
        shard: usize,
        track_id: &str,
        entries: &[(JumpCode, f64)],
    ) -> Result<i64> {
        if self.rows.contains_key(track_id) {
            return Err(DbError::DuplicateTrack(track_id.to_string()));
        }
        let track_row = self.tracks.len() as i64 + 1;
        let target = self.shard_mut(shard)?;
        target.entries.extend(entries.iter().map(|&(jump_code, weight)| FingerprintEntry {
            track_row,
            jump_code,
            weight,
        }));
        // Stale lookups are dropped rather than patched.
        target.by_code = None;
        target.by_track = None;

        self.tracks.push(track_id.to_string());
        self.rows.insert(track_id.to_string(), track_row);
        Ok(track_row)
    }

    fn lookup_by_code(
        &self,
        shard: usize,
        code: JumpCode,
        band: WeightBand,
    ) -> Result<Vec<FingerprintEntry>> {
        let s = self.shard(shard)?;
        let entries: Vec<FingerprintEntry> = match &s.by_code {
            Some(by_code) => {
                let lo = (code, OrderedFloat(band.low), 0);
                let hi = (code, OrderedFloat(band.high), usize::MAX);
                if lo > hi {
                    return Ok(Vec::new());
                }
                by_code.range(lo..=hi).map(|&(_, _, i)| s.entries[i]).collect()
            }
            None => s
                .entries
                .iter()
                .filter(|e| e.jump_code == code && band.contains(e.weight))
                .copied()
                .collect(),
        };
        Ok(entries)
    }

    fn lookup_by_track(&self, shard: usize, track_row: i64) -> Result<Vec<FingerprintEntry>> {
        let s = self.shard(shard)?;
        let entries: Vec<FingerprintEntry> = match &s.by_track {
            Some(by_track) => by_track
                .get(&track_row)
                .map(|idx| idx.iter().map(|&i| s.entries[i]).collect())
                .unwrap_or_default(),
            None => s
                .entries
                .iter()
                .filter(|e| e.track_row == track_row)
                .copied()
                .collect(),
        };
        Ok(entries)
    }

    fn distinct_codes(&self, shard: usize) -> Result<Vec<JumpCode>> {
        let s = self.shard(shard)?;
        let codes: BTreeSet<JumpCode> = s.entries.iter().map(|e| e.jump_code).collect();
        Ok(codes.into_iter().collect())
    }

    fn reindex(&mut self) -> Result<()> {
        for shard in &mut self.shards {
            shard.rebuild();
        }
        Ok(())
    }
}
