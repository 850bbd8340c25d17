//! Chroma providers. Audio decoding and chroma extraction happen elsewhere;
//! the index only ever sees ready 12×T matrices keyed by track id.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use walkdir::WalkDir;

use super::{ChromaError, ChromaMatrix, Frame};

/// Anything that can hand out chroma matrices by track id.
pub trait ChromaSource: Sync {
    /// All track ids this source knows about, in a stable order.
    fn track_ids(&self) -> Result<Vec<String>, ChromaError>;

    /// Load the chroma for one track. `Ok(None)` means the source has no data
    /// for it.
    fn load(&self, track_id: &str) -> Result<Option<ChromaMatrix>, ChromaError>;
}

/// On-disk chroma file. Either frame-major (`{"frames": [[12 floats], ...]}`)
/// or pitch-major (`{"chroma": [[T floats] x 12]}`).
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ChromaFile {
    Frames { frames: Vec<Frame> },
    Rows { chroma: Vec<Vec<f32>> },
}

/// Read a single JSON chroma file and max-normalize its columns.
pub fn read_chroma_file(path: &Path) -> Result<ChromaMatrix, ChromaError> {
    let contents = std::fs::read_to_string(path)?;
    let file: ChromaFile = serde_json::from_str(&contents).map_err(|e| ChromaError::Json {
        path: path.display().to_string(),
        source: e,
    })?;
    let matrix = match file {
        ChromaFile::Frames { frames } => ChromaMatrix::from_frames(frames)?,
        ChromaFile::Rows { chroma } => ChromaMatrix::from_rows(&chroma)?,
    };
    Ok(matrix.normalize_columns())
}

/// A directory tree of `<track_id>.json` chroma files.
pub struct JsonChromaDir {
    files: BTreeMap<String, PathBuf>,
}

impl JsonChromaDir {
    /// Walk `root` once and remember every JSON file by its stem.
    pub fn open(root: &Path) -> Result<Self, ChromaError> {
        if !root.is_dir() {
            return Err(ChromaError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("{} is not a directory", root.display()),
            )));
        }

        let mut files = BTreeMap::new();
        for entry in WalkDir::new(root).follow_links(true).into_iter().filter_map(|e| e.ok()) {
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            let is_json = path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| e.eq_ignore_ascii_case("json"));
            if !is_json {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if let Some(prev) = files.insert(stem.to_string(), path.to_path_buf()) {
                log::warn!(
                    "Duplicate track id {}: {} shadows {}",
                    stem,
                    path.display(),
                    prev.display()
                );
            }
        }

        log::info!("Found {} chroma files under {}", files.len(), root.display());
        Ok(Self { files })
    }
}

impl ChromaSource for JsonChromaDir {
    fn track_ids(&self) -> Result<Vec<String>, ChromaError> {
        Ok(self.files.keys().cloned().collect())
    }

    fn load(&self, track_id: &str) -> Result<Option<ChromaMatrix>, ChromaError> {
        match self.files.get(track_id) {
            Some(path) => read_chroma_file(path).map(Some),
            None => Ok(None),
        }
    }
}

/// In-memory source, mostly for tests and library callers that already hold
/// their matrices.
impl ChromaSource for BTreeMap<String, ChromaMatrix> {
    fn track_ids(&self) -> Result<Vec<String>, ChromaError> {
        Ok(self.keys().cloned().collect())
    }

    fn load(&self, track_id: &str) -> Result<Option<ChromaMatrix>, ChromaError> {
        Ok(self.get(track_id).cloned())
    }
}
