use serde::Deserialize;
use thiserror::Error;

use crate::chroma::ChromaMatrix;
use crate::jumps::{EncodeError, JumpCode, JumpEncoder};
use crate::landmarks::{LandmarkDetector, LandmarkMatrix};

#[derive(Error, Debug)]
pub enum FingerprintError {
    #[error("Invalid landmark parameters: decay {decay} must be in (0, 1), max_per_frame {max_per_frame} in 1..=12")]
    Landmarks { decay: f32, max_per_frame: usize },
    #[error("Encoding error: {0}")]
    Encode(#[from] EncodeError),
}

/// Fingerprinting parameters (the `[fingerprint]` config section).
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct FingerprintParams {
    /// Max frames spanned by a jump or a chain.
    pub win: usize,
    /// Per-frame threshold decay of the landmark detector.
    pub decay: f32,
    /// Max landmarks kept per frame and scan direction.
    pub max_per_frame: usize,
    /// Chain lengths (in hops) to encode.
    pub levels: Vec<usize>,
    /// Time compression factor applied before landmark detection.
    pub compression: usize,
    /// Divide per-track code counts by log10(total count) when indexing.
    pub normalize: bool,
}

impl Default for FingerprintParams {
    fn default() -> Self {
        Self {
            win: 3,
            decay: 0.995,
            max_per_frame: 3,
            levels: vec![3],
            compression: 2,
            normalize: true,
        }
    }
}

/// Chroma → compressed chroma → landmarks → jump codes.
#[derive(Debug, Clone)]
pub struct Fingerprinter {
    detector: LandmarkDetector,
    encoder: JumpEncoder,
    compression: usize,
}

impl Fingerprinter {
    pub fn new(params: &FingerprintParams) -> Result<Self, FingerprintError> {
        let detector = LandmarkDetector::new(params.decay, params.max_per_frame).ok_or(
            FingerprintError::Landmarks {
                decay: params.decay,
                max_per_frame: params.max_per_frame,
            },
        )?;
        let encoder = JumpEncoder::new(params.win, params.levels.clone())?;
        Ok(Self {
            detector,
            encoder,
            compression: params.compression,
        })
    }

    pub fn landmarks(&self, chroma: &ChromaMatrix) -> LandmarkMatrix {
        self.detector.detect(&chroma.compress(self.compression))
    }

    /// Every chain code of the track. Empty when the chroma is too short or
    /// silent to yield landmarks.
    pub fn fingerprint(&self, chroma: &ChromaMatrix) -> Result<Vec<JumpCode>, EncodeError> {
        let landmarks = self.landmarks(chroma);
        if landmarks.is_empty() {
            return Ok(Vec::new());
        }
        self.encoder.encode(&landmarks)
    }
}
