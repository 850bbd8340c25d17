//! Jump codes: integer encodings of landmark pairs and chains.
//!
//! A single jump between landmarks `(t0, p0)` and `(t1, p1)` is encoded as
//! `Δt·144 + Δp·12 + p0`. Only the low base-12 digit (`p0`) depends on the
//! absolute key, so transposing a song by `r` semitones changes every code by
//! rotating that digit and nothing else.
//!
//! Chains of several jumps keep the property: every hop except the first is
//! reduced to its rotation-invariant part (`code - code % 12`), hops are
//! stacked in powers of `maxcode = 144·(maxwin + 1)`, and the first hop's
//! offset is added back once. The low digit of a chain code is therefore the
//! pitch of the chain's first landmark.

use std::collections::HashMap;

use thiserror::Error;

use crate::chroma::PITCH_CLASSES;
use crate::landmarks::{Landmark, LandmarkMatrix};

/// An encoded jump or chain of jumps.
pub type JumpCode = i64;

const PITCHES: i64 = PITCH_CLASSES as i64;
const TIME_STRIDE: i64 = PITCHES * PITCHES;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EncodeError {
    #[error("Chains of {levels} hops over a {win}-frame window overflow a 64-bit jump code")]
    CodeOverflow { levels: usize, win: usize },
    #[error("Hop spans {tdiff} frames, more than the encoding window of {maxwin}")]
    HopTooLong { tdiff: usize, maxwin: usize },
    #[error("Composition levels must be non-empty and every level at least 1, got {0:?}")]
    InvalidLevels(Vec<usize>),
}

/// Two landmarks `tdiff` frames and `pdiff` pitch classes apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Jump {
    pub tdiff: usize,
    pub pdiff: u8,
    pub t0: usize,
    pub p0: u8,
}

impl Jump {
    pub fn start(&self) -> Landmark {
        Landmark { time: self.t0, pitch: self.p0 }
    }

    pub fn end(&self) -> Landmark {
        Landmark {
            time: self.t0 + self.tdiff,
            pitch: (self.p0 + self.pdiff) % PITCH_CLASSES as u8,
        }
    }

    pub fn code(&self) -> JumpCode {
        get_jump_code(self.tdiff, self.pdiff, self.p0)
    }
}

/// A chain of `hops()` jumps whose consecutive endpoints coincide, stored as
/// its landmark points.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ComposedJump {
    points: Vec<Landmark>,
}

impl ComposedJump {
    /// At least two time-ordered points; `None` otherwise.
    pub fn from_points(points: Vec<Landmark>) -> Option<Self> {
        let ordered = points.windows(2).all(|w| w[0].time <= w[1].time);
        (points.len() >= 2 && ordered).then_some(Self { points })
    }

    pub fn points(&self) -> &[Landmark] {
        &self.points
    }

    pub fn hops(&self) -> usize {
        self.points.len() - 1
    }

    /// Frames between the first and last landmark.
    pub fn span(&self) -> usize {
        self.points[self.points.len() - 1].time - self.points[0].time
    }

    /// The same chain with every pitch shifted up by `rotation` semitones.
    ///
    /// # Panics
    /// If `rotation >= 12`.
    pub fn rotated(&self, rotation: u8) -> Self {
        assert!((rotation as usize) < PITCH_CLASSES, "rotation {rotation} out of range");
        let points = self
            .points
            .iter()
            .map(|l| Landmark {
                time: l.time,
                pitch: (l.pitch + rotation) % PITCH_CLASSES as u8,
            })
            .collect();
        Self { points }
    }
}

/// `Δt·144 + Δp·12 + p0`.
///
/// # Panics
/// If `pdiff` or `poffset` is not a pitch class (0..12).
pub fn get_jump_code(tdiff: usize, pdiff: u8, poffset: u8) -> JumpCode {
    assert!((pdiff as usize) < PITCH_CLASSES, "pitch difference {pdiff} out of range");
    assert!((poffset as usize) < PITCH_CLASSES, "pitch offset {poffset} out of range");
    tdiff as i64 * TIME_STRIDE + pdiff as i64 * PITCHES + poffset as i64
}

/// Replace the low digit `p` of a code by `(p + rotation) % 12`.
///
/// # Panics
/// If `rotation >= 12`.
pub fn rotate_jump_code(code: JumpCode, rotation: u8) -> JumpCode {
    assert!((rotation as usize) < PITCH_CLASSES, "rotation {rotation} out of range");
    let (invariant, offset) = split_jump_code(code);
    join_jump_code(invariant, (offset + rotation) % PITCH_CLASSES as u8)
}

/// Split a code into its rotation-invariant part and its pitch offset.
pub fn split_jump_code(code: JumpCode) -> (JumpCode, u8) {
    let offset = code.rem_euclid(PITCHES);
    (code - offset, offset as u8)
}

/// Inverse of [`split_jump_code`].
pub fn join_jump_code(invariant: JumpCode, offset: u8) -> JumpCode {
    invariant + offset as i64
}

/// Base used to stack chain hops: one more than the largest single-hop code
/// a `maxwin` window can produce, rounded to a multiple of 12.
pub fn max_code_base(maxwin: usize) -> Option<JumpCode> {
    i64::try_from(maxwin).ok()?.checked_add(1)?.checked_mul(TIME_STRIDE)
}

/// All landmark pairs `(p0,t0) → (p1,t1)` with `t0 <= t1 <= t0 + win`,
/// excluding a landmark paired with itself.
///
/// Cost grows with landmark density squared times `win`; the detector's
/// per-frame cap keeps it bounded.
pub fn get_jumps(landmarks: &LandmarkMatrix, win: usize) -> Vec<Jump> {
    let frames = landmarks.frames();
    let mut jumps = Vec::new();

    for t0 in 0..frames {
        for p0 in landmarks.pitches_at(t0) {
            let last = t0.saturating_add(win).min(frames.saturating_sub(1));
            for t1 in t0..=last {
                for p1 in landmarks.pitches_at(t1) {
                    if t1 == t0 && p1 == p0 {
                        continue;
                    }
                    let pdiff = (p1 + PITCH_CLASSES as u8 - p0) % PITCH_CLASSES as u8;
                    jumps.push(Jump { tdiff: t1 - t0, pdiff, t0, p0 });
                }
            }
        }
    }

    jumps
}

/// Chain jumps head-to-tail into every requested length (in hops), keeping
/// chains whose total span is at most `win`. Output is grouped by level in the
/// order `levels` lists them.
///
/// Each level joins the previous level's chains to single jumps through a hash
/// index on the jump start point.
///
/// # Panics
/// If `levels` is empty or contains 0.
pub fn get_composed_jumps(jumps: &[Jump], levels: &[usize], win: usize) -> Vec<ComposedJump> {
    assert!(!levels.is_empty() && !levels.contains(&0), "invalid levels {levels:?}");
    let max_level = levels.iter().copied().max().unwrap_or(1);

    let mut by_start: HashMap<Landmark, Vec<Landmark>> = HashMap::new();
    for j in jumps {
        by_start.entry(j.start()).or_default().push(j.end());
    }

    let mut by_level: Vec<Vec<ComposedJump>> = Vec::with_capacity(max_level);
    by_level.push(
        jumps
            .iter()
            .filter(|j| j.tdiff <= win)
            .map(|j| ComposedJump { points: vec![j.start(), j.end()] })
            .collect(),
    );

    for _ in 2..=max_level {
        let prev = &by_level[by_level.len() - 1];
        let mut next = Vec::new();
        for chain in prev {
            let head = chain.points[0];
            let tail = chain.points[chain.points.len() - 1];
            let Some(ends) = by_start.get(&tail) else {
                continue;
            };
            for end in ends {
                if end.time - head.time > win {
                    continue;
                }
                let mut points = Vec::with_capacity(chain.points.len() + 1);
                points.extend_from_slice(&chain.points);
                points.push(*end);
                next.push(ComposedJump { points });
            }
        }
        by_level.push(next);
    }

    levels
        .iter()
        .flat_map(|&lvl| by_level[lvl - 1].iter().cloned())
        .collect()
}

/// Encode a chain. The result modulo 12 is the pitch of the first landmark;
/// everything above that digit is invariant under transposition.
pub fn get_jumpcode_from_composed_jump(
    chain: &ComposedJump,
    maxwin: usize,
) -> Result<JumpCode, EncodeError> {
    let overflow = || EncodeError::CodeOverflow { levels: chain.hops(), win: maxwin };
    let base = max_code_base(maxwin).ok_or_else(overflow)?;

    let mut code: JumpCode = 0;
    let mut scale: JumpCode = 1;
    let mut first_offset = 0u8;

    for (i, pair) in chain.points.windows(2).enumerate() {
        let (from, to) = (pair[0], pair[1]);
        let tdiff = to.time - from.time;
        if tdiff > maxwin {
            return Err(EncodeError::HopTooLong { tdiff, maxwin });
        }
        let pdiff = (to.pitch + PITCH_CLASSES as u8 - from.pitch) % PITCH_CLASSES as u8;
        let (invariant, offset) = split_jump_code(get_jump_code(tdiff, pdiff, from.pitch));
        if i == 0 {
            first_offset = offset;
        } else {
            scale = scale.checked_mul(base).ok_or_else(overflow)?;
        }
        code = invariant
            .checked_mul(scale)
            .and_then(|v| code.checked_add(v))
            .ok_or_else(overflow)?;
    }

    code.checked_add(first_offset as i64).ok_or_else(overflow)
}

/// Landmarks → jumps → chains → codes, for a fixed window and level set.
#[derive(Debug, Clone)]
pub struct JumpEncoder {
    win: usize,
    levels: Vec<usize>,
}

impl JumpEncoder {
    /// Validates the level set and checks that the longest chain's code fits
    /// in 64 bits, so encoding can never silently wrap.
    pub fn new(win: usize, levels: Vec<usize>) -> Result<Self, EncodeError> {
        if levels.is_empty() || levels.contains(&0) {
            return Err(EncodeError::InvalidLevels(levels));
        }
        let max_level = levels.iter().copied().max().unwrap_or(1);
        let fits = max_code_base(win)
            .zip(u32::try_from(max_level).ok())
            .and_then(|(base, exp)| base.checked_pow(exp))
            .is_some();
        if !fits {
            return Err(EncodeError::CodeOverflow { levels: max_level, win });
        }
        Ok(Self { win, levels })
    }

    pub fn win(&self) -> usize {
        self.win
    }

    pub fn levels(&self) -> &[usize] {
        &self.levels
    }

    /// Every chain code of the landmark matrix, in a deterministic order.
    /// Duplicates are kept; the index turns them into weights.
    pub fn encode(&self, landmarks: &LandmarkMatrix) -> Result<Vec<JumpCode>, EncodeError> {
        let jumps = get_jumps(landmarks, self.win);
        let chains = get_composed_jumps(&jumps, &self.levels, self.win);
        log::trace!("{} landmarks, {} jumps, {} chains", landmarks.count(), jumps.len(), chains.len());
        chains
            .iter()
            .map(|c| get_jumpcode_from_composed_jump(c, self.win))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lm(time: usize, pitch: u8) -> Landmark {
        Landmark { time, pitch }
    }

    #[test]
    fn test_jump_code_layout() {
        assert_eq!(get_jump_code(0, 0, 0), 0);
        assert_eq!(get_jump_code(1, 0, 0), 144);
        assert_eq!(get_jump_code(2, 3, 4), 2 * 144 + 3 * 12 + 4);
    }

    #[test]
    #[should_panic]
    fn test_jump_code_rejects_bad_pitch() {
        get_jump_code(1, 12, 0);
    }

    #[test]
    fn test_split_join_round_trip() {
        for tdiff in 0..12 {
            for pdiff in 0..12u8 {
                for p0 in 0..12u8 {
                    let code = get_jump_code(tdiff, pdiff, p0);
                    let (inv, off) = split_jump_code(code);
                    assert_eq!(off, p0);
                    assert_eq!(inv % 12, 0);
                    assert_eq!(join_jump_code(inv, off), code);
                }
            }
        }
    }

    #[test]
    fn test_rotate_wraps_low_digit() {
        let code = get_jump_code(2, 5, 10);
        assert_eq!(rotate_jump_code(code, 0), code);
        assert_eq!(rotate_jump_code(code, 1), get_jump_code(2, 5, 11));
        assert_eq!(rotate_jump_code(code, 3), get_jump_code(2, 5, 1));
        // Twelve single steps come back around
        let mut c = code;
        for _ in 0..12 {
            c = rotate_jump_code(c, 1);
        }
        assert_eq!(c, code);
    }

    #[test]
    fn test_get_jumps_window_is_inclusive() {
        // Cells are (pitch, time).
        let m = LandmarkMatrix::from_cells(10, &[(0, 0), (4, 3), (1, 4)]);
        let jumps = get_jumps(&m, 3);
        // t=0 -> t=3 is exactly the window: kept. t=0 -> t=4 is not.
        assert!(jumps.contains(&Jump { tdiff: 3, pdiff: 4, t0: 0, p0: 0 }));
        assert!(!jumps.iter().any(|j| j.t0 == 0 && j.tdiff == 4));
        // Pitch 4 -> pitch 1 wraps: (1 - 4 + 12) % 12
        assert!(jumps.contains(&Jump { tdiff: 1, pdiff: 9, t0: 3, p0: 4 }));
        assert_eq!(jumps.len(), 2);
    }

    #[test]
    fn test_get_jumps_huge_window_stops_at_last_frame() {
        let m = LandmarkMatrix::from_cells(4, &[(0, 0), (4, 3)]);
        assert_eq!(get_jumps(&m, usize::MAX), vec![Jump { tdiff: 3, pdiff: 4, t0: 0, p0: 0 }]);
    }

    #[test]
    fn test_get_jumps_same_frame_both_directions() {
        let m = LandmarkMatrix::from_cells(1, &[(2, 0), (5, 0)]);
        let jumps = get_jumps(&m, 3);
        assert_eq!(jumps.len(), 2);
        assert!(jumps.contains(&Jump { tdiff: 0, pdiff: 3, t0: 0, p0: 2 }));
        assert!(jumps.contains(&Jump { tdiff: 0, pdiff: 9, t0: 0, p0: 5 }));
    }

    #[test]
    fn test_jump_endpoints() {
        let j = Jump { tdiff: 2, pdiff: 9, t0: 5, p0: 7 };
        assert_eq!(j.start(), lm(5, 7));
        assert_eq!(j.end(), lm(7, 4));
    }

    /// Brute-force reference for the hash join: enumerate every sequence of
    /// jumps and keep the connected, short-enough ones.
    fn brute_force_chains(jumps: &[Jump], level: usize, win: usize) -> Vec<Vec<Landmark>> {
        let mut chains: Vec<Vec<Landmark>> = jumps
            .iter()
            .filter(|j| j.tdiff <= win)
            .map(|j| vec![j.start(), j.end()])
            .collect();
        for _ in 1..level {
            let mut next = Vec::new();
            for c in &chains {
                for j in jumps {
                    if j.start() == *c.last().unwrap() && j.end().time - c[0].time <= win {
                        let mut n = c.clone();
                        n.push(j.end());
                        next.push(n);
                    }
                }
            }
            chains = next;
        }
        chains.sort();
        chains
    }

    #[test]
    fn test_composed_jumps_match_brute_force() {
        let m = LandmarkMatrix::from_cells(
            8,
            &[(0, 0), (4, 0), (7, 1), (2, 2), (9, 2), (4, 3), (11, 4), (0, 5), (5, 6), (5, 7)],
        );
        let win = 3;
        let jumps = get_jumps(&m, win);
        for level in 1..=4 {
            let mut got: Vec<Vec<Landmark>> = get_composed_jumps(&jumps, &[level], win)
                .into_iter()
                .map(|c| c.points().to_vec())
                .collect();
            got.sort();
            assert_eq!(got, brute_force_chains(&jumps, level, win), "level {level}");
            assert!(got.iter().all(|c| c.len() == level + 1));
        }
    }

    #[test]
    fn test_composed_jumps_respect_span() {
        let m = LandmarkMatrix::from_cells(8, &[(0, 0), (2, 1), (4, 2), (6, 4)]);
        let jumps = get_jumps(&m, 3);
        let chains = get_composed_jumps(&jumps, &[2], 3);
        assert!(!chains.is_empty());
        assert!(chains.iter().all(|c| c.span() <= 3 && c.hops() == 2));
        // 0 -> 2 -> 4 spans 4 frames and must not appear
        assert!(!chains.iter().any(|c| c.points()[0].time == 0 && c.points()[2].time == 4));
    }

    #[test]
    fn test_composed_jumps_level_order() {
        let m = LandmarkMatrix::from_cells(4, &[(0, 0), (1, 1), (2, 2)]);
        let jumps = get_jumps(&m, 3);
        let chains = get_composed_jumps(&jumps, &[2, 1], 3);
        let hops: Vec<usize> = chains.iter().map(|c| c.hops()).collect();
        let first_one = hops.iter().position(|&h| h == 1).unwrap();
        assert!(hops[..first_one].iter().all(|&h| h == 2));
        assert!(hops[first_one..].iter().all(|&h| h == 1));
    }

    #[test]
    fn test_single_hop_chain_code_equals_jump_code() {
        let chain = ComposedJump::from_points(vec![lm(4, 9), lm(6, 2)]).unwrap();
        let j = Jump { tdiff: 2, pdiff: 5, t0: 4, p0: 9 };
        assert_eq!(get_jumpcode_from_composed_jump(&chain, 3).unwrap(), j.code());
    }

    #[test]
    fn test_chain_code_layout() {
        let maxwin = 3;
        let base = max_code_base(maxwin).unwrap();
        assert_eq!(base, 576);
        let chain = ComposedJump::from_points(vec![lm(0, 3), lm(1, 5), lm(3, 4)]).unwrap();
        let hop0 = get_jump_code(1, 2, 3);
        let hop1 = get_jump_code(2, 11, 5);
        let expected = (hop0 - 3) + (hop1 - 5) * base + 3;
        assert_eq!(get_jumpcode_from_composed_jump(&chain, maxwin).unwrap(), expected);
    }

    #[test]
    fn test_chain_rotation_only_moves_low_digit() {
        let chains = [
            vec![lm(0, 0), lm(1, 7), lm(2, 3), lm(3, 11)],
            vec![lm(5, 11), lm(5, 2), lm(7, 2)],
            vec![lm(2, 6), lm(5, 1)],
            vec![lm(0, 4), lm(0, 9), lm(0, 4), lm(1, 8), lm(3, 0)],
        ];
        for points in chains {
            let chain = ComposedJump::from_points(points).unwrap();
            let code = get_jumpcode_from_composed_jump(&chain, 6).unwrap();
            assert_eq!(code % 12, chain.points()[0].pitch as i64);
            for r in 0..12u8 {
                let rotated = get_jumpcode_from_composed_jump(&chain.rotated(r), 6).unwrap();
                assert_eq!(rotated, rotate_jump_code(code, r), "rotation {r}");
                assert_eq!(split_jump_code(rotated).0, split_jump_code(code).0);
            }
        }
    }

    #[test]
    #[should_panic(expected = "rotation 250 out of range")]
    fn test_chain_rotation_rejects_bad_rotation() {
        let chain = ComposedJump::from_points(vec![lm(0, 11), lm(1, 4)]).unwrap();
        chain.rotated(250);
    }

    #[test]
    fn test_distinct_chains_get_distinct_codes() {
        let a = ComposedJump::from_points(vec![lm(0, 0), lm(1, 1), lm(2, 2)]).unwrap();
        let b = ComposedJump::from_points(vec![lm(0, 0), lm(1, 2), lm(2, 2)]).unwrap();
        let c = ComposedJump::from_points(vec![lm(0, 0), lm(2, 1), lm(3, 2)]).unwrap();
        let codes: Vec<_> = [a, b, c]
            .iter()
            .map(|x| get_jumpcode_from_composed_jump(x, 3).unwrap())
            .collect();
        assert_ne!(codes[0], codes[1]);
        assert_ne!(codes[0], codes[2]);
        assert_ne!(codes[1], codes[2]);
    }

    #[test]
    fn test_hop_longer_than_window_is_rejected() {
        let chain = ComposedJump::from_points(vec![lm(0, 0), lm(5, 0)]).unwrap();
        assert_eq!(
            get_jumpcode_from_composed_jump(&chain, 3),
            Err(EncodeError::HopTooLong { tdiff: 5, maxwin: 3 })
        );
    }

    #[test]
    fn test_overflow_fails_fast() {
        assert!(JumpEncoder::new(3, vec![3]).is_ok());
        assert!(JumpEncoder::new(1000, vec![3]).is_ok());
        assert_eq!(
            JumpEncoder::new(1000, vec![1, 4]).unwrap_err(),
            EncodeError::CodeOverflow { levels: 4, win: 1000 }
        );
        assert!(matches!(JumpEncoder::new(3, vec![]), Err(EncodeError::InvalidLevels(_))));
        assert!(matches!(JumpEncoder::new(3, vec![0, 2]), Err(EncodeError::InvalidLevels(_))));

        // Encoding a chain directly with an absurd window also refuses to wrap.
        let long = ComposedJump::from_points((0..6).map(|t| lm(t * 1000, 0)).collect()).unwrap();
        assert!(matches!(
            get_jumpcode_from_composed_jump(&long, 1_000_000),
            Err(EncodeError::CodeOverflow { .. })
        ));
    }

    #[test]
    fn test_encoder_is_deterministic() {
        let m = LandmarkMatrix::from_cells(
            20,
            &(0..20).map(|t| (((t * 7) % 12) as u8, t)).collect::<Vec<_>>(),
        );
        let enc = JumpEncoder::new(3, vec![3]).unwrap();
        let a = enc.encode(&m).unwrap();
        let b = enc.encode(&m).unwrap();
        assert!(!a.is_empty());
        assert_eq!(a, b);
    }

    #[test]
    fn test_encoder_on_empty_landmarks() {
        let enc = JumpEncoder::new(3, vec![3]).unwrap();
        assert!(enc.encode(&LandmarkMatrix::empty(50)).unwrap().is_empty());
        assert!(enc.encode(&LandmarkMatrix::empty(0)).unwrap().is_empty());
    }
}
