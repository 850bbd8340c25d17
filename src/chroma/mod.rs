pub mod source;

use thiserror::Error;

/// Number of pitch classes in a chroma frame.
pub const PITCH_CLASSES: usize = 12;

/// One chroma column: energy per pitch class at a single time frame.
pub type Frame = [f32; PITCH_CLASSES];

#[derive(Error, Debug)]
pub enum ChromaError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error in {path}: {source}")]
    Json {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("Expected 12 pitch rows, found {0}")]
    PitchRows(usize),
    #[error("Pitch rows have unequal lengths")]
    RaggedRows,
    #[error("Non-finite chroma value at pitch {pitch}, frame {frame}")]
    NonFinite { pitch: usize, frame: usize },
}

/// A 12×T chroma matrix, stored frame by frame.
///
/// Pitch rows, time columns. Producers are expected to normalize each column
/// so its maximum is 1 (see [`ChromaMatrix::normalize_columns`]).
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ChromaMatrix {
    frames: Vec<Frame>,
}

impl ChromaMatrix {
    /// Build from time-ordered frames. Rejects NaN / infinite values.
    pub fn from_frames(frames: Vec<Frame>) -> Result<Self, ChromaError> {
        for (t, frame) in frames.iter().enumerate() {
            if let Some(p) = frame.iter().position(|v| !v.is_finite()) {
                return Err(ChromaError::NonFinite { pitch: p, frame: t });
            }
        }
        Ok(Self { frames })
    }

    /// Build from 12 pitch rows of equal length (the 12×T layout).
    pub fn from_rows(rows: &[Vec<f32>]) -> Result<Self, ChromaError> {
        if rows.len() != PITCH_CLASSES {
            return Err(ChromaError::PitchRows(rows.len()));
        }
        let n = rows[0].len();
        if rows.iter().any(|r| r.len() != n) {
            return Err(ChromaError::RaggedRows);
        }
        let frames = (0..n)
            .map(|t| std::array::from_fn(|p| rows[p][t]))
            .collect();
        Self::from_frames(frames)
    }

    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    /// Number of time frames (T).
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn get(&self, pitch: usize, time: usize) -> f32 {
        self.frames[time][pitch]
    }

    /// Scale every column so its maximum is 1. All-zero columns stay zero.
    pub fn normalize_columns(mut self) -> Self {
        for frame in &mut self.frames {
            let max = frame.iter().copied().fold(0.0_f32, f32::max);
            if max > 0.0 {
                for v in frame.iter_mut() {
                    *v /= max;
                }
            }
        }
        self
    }

    /// Time compression: average each run of `factor` consecutive frames into
    /// one frame, then renormalize columns. A trailing partial run is averaged
    /// over its own length. Factors 0 and 1 leave the matrix unchanged.
    pub fn compress(&self, factor: usize) -> Self {
        if factor <= 1 {
            return self.clone();
        }
        let frames = self
            .frames
            .chunks(factor)
            .map(|run| {
                let mut out = [0.0_f32; PITCH_CLASSES];
                for frame in run {
                    for (o, v) in out.iter_mut().zip(frame) {
                        *o += v;
                    }
                }
                let n = run.len() as f32;
                out.map(|v| v / n)
            })
            .collect();
        Self { frames }.normalize_columns()
    }

    /// Cyclically shift every pitch class up by `semitones` (key transposition):
    /// energy at pitch `p` moves to pitch `(p + semitones) % 12`.
    pub fn transpose(&self, semitones: usize) -> Self {
        let r = semitones % PITCH_CLASSES;
        let frames = self
            .frames
            .iter()
            .map(|frame| std::array::from_fn(|p| frame[(p + PITCH_CLASSES - r) % PITCH_CLASSES]))
            .collect();
        Self { frames }
    }
}
