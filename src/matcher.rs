//! Rotation-aware candidate selection.
//!
//! Every query code is probed in all twelve key rotations. Hits are counted
//! per (track, rotation); a track's score is its best rotation's count.

use std::collections::HashMap;

use thiserror::Error;

use crate::chroma::PITCH_CLASSES;
use crate::db::models::WeightBand;
use crate::db::FingerprintStore;
use crate::index::{FingerprintIndex, IndexError};
use crate::jumps::{rotate_jump_code, JumpCode};

#[derive(Error, Debug)]
pub enum QueryError {
    #[error("Unknown track: {0}")]
    UnknownTrack(String),
    #[error("Weight margin must be finite and non-negative, got {0}")]
    InvalidMargin(f64),
    #[error("Index error: {0}")]
    Index(#[from] IndexError),
}

/// What to search with.
#[derive(Debug, Clone, Copy)]
pub enum QuerySource<'a> {
    /// Weighted codes, e.g. from a fingerprint computed on the fly.
    Codes(&'a [(JumpCode, f64)]),
    /// The stored codes of an indexed track. The track itself is excluded
    /// from the results.
    Track(&'a str),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchCandidate {
    pub track_id: String,
    pub track_row: i64,
    /// Hits under the best rotation.
    pub score: u32,
    /// Semitones the query must be shifted up to line up with this track.
    pub rotation: u8,
}

/// Rank indexed tracks by rotation-aware code overlap with `source`.
///
/// A stored entry is a hit for a probe when the codes are equal and the
/// stored weight lies in `[w·(1−m), w·(1+m)]`. Results are ordered by score,
/// highest first, then by row id. Tracks with no hit are left out.
pub fn select_matches<S: FingerprintStore>(
    index: &FingerprintIndex<S>,
    source: QuerySource<'_>,
    weight_margin: f64,
) -> Result<Vec<MatchCandidate>, QueryError> {
    if !weight_margin.is_finite() || weight_margin < 0.0 {
        return Err(QueryError::InvalidMargin(weight_margin));
    }

    let stored;
    let (codes, exclude) = match source {
        QuerySource::Codes(codes) => (codes, None),
        QuerySource::Track(track_id) => {
            let row = index
                .track_row(track_id)
                .ok_or_else(|| QueryError::UnknownTrack(track_id.to_string()))?;
            stored = index.codes_for_track(row)?;
            (stored.as_slice(), Some(row))
        }
    };

    let mut counts: HashMap<i64, [u32; PITCH_CLASSES]> = HashMap::new();
    let mut probes = 0usize;
    for &(code, weight) in codes {
        let band = WeightBand::around(weight, weight_margin);
        for rotation in 0..PITCH_CLASSES as u8 {
            let probe = rotate_jump_code(code, rotation);
            if !index.knows_code(probe) {
                continue;
            }
            probes += 1;
            for hit in index.lookup(probe, band)? {
                if Some(hit.track_row) == exclude {
                    continue;
                }
                counts.entry(hit.track_row).or_insert([0; PITCH_CLASSES])[rotation as usize] += 1;
            }
        }
    }

    let mut matches: Vec<MatchCandidate> = counts
        .into_iter()
        .filter_map(|(row, per_rotation)| {
            let score = per_rotation.iter().copied().max().unwrap_or(0);
            if score == 0 {
                return None;
            }
            let rotation = per_rotation.iter().position(|&c| c == score).unwrap_or(0) as u8;
            let track_id = index.track_id(row)?.to_string();
            Some(MatchCandidate {
                track_id,
                track_row: row,
                score,
                rotation,
            })
        })
        .collect();
    matches.sort_by(|a, b| b.score.cmp(&a.score).then(a.track_row.cmp(&b.track_row)));

    log::debug!(
        "{} query codes, {} probes, {} candidates",
        codes.len(),
        probes,
        matches.len()
    );
    Ok(matches)
}

/// Track ids of `select_matches`, best first.
pub fn ranked_track_ids<S: FingerprintStore>(
    index: &FingerprintIndex<S>,
    source: QuerySource<'_>,
    weight_margin: f64,
) -> Result<Vec<String>, QueryError> {
    Ok(select_matches(index, source, weight_margin)?
        .into_iter()
        .map(|m| m.track_id)
        .collect())
}
