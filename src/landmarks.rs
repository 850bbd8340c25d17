//! Adaptive peak picking on chroma matrices.
//!
//! A landmark is a (pitch, frame) cell that rises above a decaying per-pitch
//! threshold when the matrix is scanned forward *and* when it is scanned
//! backward. Requiring both directions rejects one-sided spurious peaks.

use crate::chroma::{ChromaMatrix, Frame, PITCH_CLASSES};

/// Frames used to seed the per-pitch threshold.
const THRESHOLD_SEED_FRAMES: usize = 10;

/// A single landmark cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Landmark {
    pub time: usize,
    pub pitch: u8,
}

/// Binary 12×T matrix, one 12-bit mask per frame (bit `p` set = landmark at pitch `p`).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LandmarkMatrix {
    masks: Vec<u16>,
}

impl LandmarkMatrix {
    /// All-zero matrix with `frames` columns.
    pub fn empty(frames: usize) -> Self {
        Self { masks: vec![0; frames] }
    }

    /// Build from explicit cells. Cells outside `frames` are ignored.
    pub fn from_cells(frames: usize, cells: &[(u8, usize)]) -> Self {
        let mut m = Self::empty(frames);
        for &(pitch, time) in cells {
            if time < frames && (pitch as usize) < PITCH_CLASSES {
                m.masks[time] |= 1 << pitch;
            }
        }
        m
    }

    /// Number of frames (T).
    pub fn frames(&self) -> usize {
        self.masks.len()
    }

    pub fn get(&self, pitch: u8, time: usize) -> bool {
        self.masks[time] & (1 << pitch) != 0
    }

    /// Pitches marked in one frame, ascending.
    pub fn pitches_at(&self, time: usize) -> impl Iterator<Item = u8> + '_ {
        let mask = self.masks[time];
        (0..PITCH_CLASSES as u8).filter(move |p| mask & (1 << p) != 0)
    }

    pub fn count_in_frame(&self, time: usize) -> usize {
        self.masks[time].count_ones() as usize
    }

    pub fn count(&self) -> usize {
        self.masks.iter().map(|m| m.count_ones() as usize).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.masks.iter().all(|&m| m == 0)
    }

    /// Every landmark in (time, pitch) order.
    pub fn iter(&self) -> impl Iterator<Item = Landmark> + '_ {
        (0..self.frames()).flat_map(move |t| self.pitches_at(t).map(move |p| Landmark { time: t, pitch: p }))
    }

    fn and(mut self, other: &Self) -> Self {
        for (a, b) in self.masks.iter_mut().zip(&other.masks) {
            *a &= *b;
        }
        self
    }
}

/// Forward/backward adaptive-threshold landmark detector.
#[derive(Debug, Clone, Copy)]
pub struct LandmarkDetector {
    decay: f32,
    max_per_frame: usize,
}

impl LandmarkDetector {
    /// `decay` must lie in (0, 1); `max_per_frame` in 1..=12.
    pub fn new(decay: f32, max_per_frame: usize) -> Option<Self> {
        let decay_ok = decay > 0.0 && decay < 1.0;
        let k_ok = (1..=PITCH_CLASSES).contains(&max_per_frame);
        (decay_ok && k_ok).then_some(Self { decay, max_per_frame })
    }

    pub fn decay(&self) -> f32 {
        self.decay
    }

    pub fn max_per_frame(&self) -> usize {
        self.max_per_frame
    }

    /// Landmarks seen from both scan directions.
    ///
    /// Matrices shorter than the threshold seed window produce an all-zero
    /// result: no fingerprint, not an error.
    pub fn detect(&self, chroma: &ChromaMatrix) -> LandmarkMatrix {
        let frames = chroma.frames();
        if frames.len() < THRESHOLD_SEED_FRAMES {
            return LandmarkMatrix::empty(frames.len());
        }

        let forward = self.pass(frames.iter());
        let mut backward = self.pass(frames.iter().rev());
        backward.masks.reverse();

        forward.and(&backward)
    }

    /// One directional scan. Frames arrive in scan order; the result is in
    /// the same order.
    fn pass<'a>(&self, frames: impl Iterator<Item = &'a Frame> + Clone) -> LandmarkMatrix {
        let mut thresh = [0.0_f32; PITCH_CLASSES];
        for frame in frames.clone().take(THRESHOLD_SEED_FRAMES) {
            for (s, &v) in thresh.iter_mut().zip(frame) {
                *s = s.max(v);
            }
        }

        let mut masks = Vec::new();
        let mut order: [usize; PITCH_CLASSES] = std::array::from_fn(|p| p);

        for frame in frames {
            let surplus: [f32; PITCH_CLASSES] = std::array::from_fn(|p| (frame[p] - thresh[p]).max(0.0));
            order.sort_by(|&a, &b| surplus[b].total_cmp(&surplus[a]).then(a.cmp(&b)));

            let mut mask = 0u16;
            for (rank, &p) in order.iter().take(self.max_per_frame).enumerate() {
                let v = frame[p];
                if v <= thresh[p] {
                    continue;
                }
                mask |= 1 << p;
                thresh[p] = v;
                if rank == 0 {
                    let floor = v * self.decay;
                    for s in thresh.iter_mut() {
                        *s = s.max(floor);
                    }
                }
            }
            masks.push(mask);

            for s in thresh.iter_mut() {
                *s *= self.decay;
            }
        }

        LandmarkMatrix { masks }
    }
}
