use std::collections::HashSet;

use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;
use thiserror::Error;

use crate::chroma::source::ChromaSource;
use crate::chroma::{ChromaError, ChromaMatrix};
use crate::db::memory::MemoryStore;
use crate::db::FingerprintStore;
use crate::fingerprint::Fingerprinter;
use crate::index::{FingerprintIndex, IndexError, IndexWriter, InsertOutcome};
use crate::jumps::EncodeError;

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Chroma error: {0}")]
    Chroma(#[from] ChromaError),
    #[error("Encoding error: {0}")]
    Encode(#[from] EncodeError),
    #[error("Index error: {0}")]
    Index(#[from] IndexError),
    #[error("Thread pool error: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestSummary {
    pub indexed: u64,
    pub no_fingerprint: u64,
    /// Already indexed, missing from the source, or not normalizable.
    pub skipped: u64,
    /// Unreadable chroma.
    pub failed: u64,
}

impl IngestSummary {
    fn add(&mut self, other: &IngestSummary) {
        self.indexed += other.indexed;
        self.no_fingerprint += other.no_fingerprint;
        self.skipped += other.skipped;
        self.failed += other.failed;
    }
}

fn progress_bar(len: usize) -> ProgressBar {
    let pb = ProgressBar::new(len as u64);
    pb.set_style(
        ProgressStyle::with_template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-"),
    );
    pb
}

/// Fingerprint one chroma matrix and store it under `track_id`.
pub fn index_track<S: FingerprintStore>(
    writer: &mut IndexWriter<'_, S>,
    fingerprinter: &Fingerprinter,
    track_id: &str,
    chroma: &ChromaMatrix,
    normalize: bool,
) -> Result<InsertOutcome, IngestError> {
    let codes = fingerprinter.fingerprint(chroma)?;
    Ok(writer.insert(track_id, &codes, normalize)?)
}

/// Fingerprint and store `track_ids` one after another, then reindex.
pub fn ingest<S: FingerprintStore, C: ChromaSource>(
    index: &mut FingerprintIndex<S>,
    source: &C,
    track_ids: &[String],
    fingerprinter: &Fingerprinter,
    normalize: bool,
) -> Result<IngestSummary, IngestError> {
    let pb = progress_bar(track_ids.len());
    let summary = ingest_slice(index, source, track_ids, fingerprinter, normalize, &pb)?;
    pb.finish_with_message(format!("Done: {} indexed", summary.indexed));
    index.reindex()?;
    Ok(summary)
}

/// Split `track_ids` into `jobs` contiguous slices, fingerprint each slice on
/// its own rayon worker into a private in-memory index, then merge the worker
/// indexes into `index` in slice order and reindex.
///
/// Row ids come out the same as with [`ingest`] over the same list.
pub fn ingest_parallel<S: FingerprintStore, C: ChromaSource>(
    index: &mut FingerprintIndex<S>,
    source: &C,
    track_ids: &[String],
    fingerprinter: &Fingerprinter,
    normalize: bool,
    jobs: usize,
) -> Result<IngestSummary, IngestError> {
    let mut summary = IngestSummary::default();
    // First occurrence of each unregistered id, in input order.
    let mut seen = HashSet::new();
    let pending: Vec<String> = track_ids
        .iter()
        .filter(|&id| index.track_row(id).is_none() && seen.insert(id.as_str()))
        .cloned()
        .collect();
    summary.skipped += (track_ids.len() - pending.len()) as u64;

    if pending.is_empty() {
        log::info!("No new tracks to index");
        return Ok(summary);
    }

    let jobs = jobs.max(1);
    let slice_len = pending.len().div_ceil(jobs);
    log::info!("Indexing {} tracks with {} workers", pending.len(), jobs);

    let pb = progress_bar(pending.len());
    let pool = rayon::ThreadPoolBuilder::new().num_threads(jobs).build()?;

    let workers: Vec<(FingerprintIndex<MemoryStore>, IngestSummary)> = pool.install(|| {
        pending
            .par_chunks(slice_len)
            .map(|slice| -> Result<_, IngestError> {
                let mut worker = FingerprintIndex::open(MemoryStore::new(), u64::MAX)?;
                let s = ingest_slice(&mut worker, source, slice, fingerprinter, normalize, &pb)?;
                Ok((worker, s))
            })
            .collect::<Result<Vec<_>, IngestError>>()
    })?;
    pb.finish_with_message("fingerprinted");

    let merge_pb = progress_bar(workers.len());
    merge_pb.set_message("merging");
    for (worker, s) in &workers {
        let merged = index.merge_from(worker)? as u64;
        summary.add(&IngestSummary {
            indexed: merged,
            skipped: s.skipped + s.indexed.saturating_sub(merged),
            ..*s
        });
        merge_pb.inc(1);
    }
    merge_pb.finish_with_message(format!("Done: {} indexed", summary.indexed));

    index.reindex()?;
    Ok(summary)
}

/// Load, fingerprint and insert each track. Unreadable or missing chroma is
/// logged and counted; an encoding overflow aborts the run.
fn ingest_slice<S: FingerprintStore, C: ChromaSource>(
    index: &mut FingerprintIndex<S>,
    source: &C,
    track_ids: &[String],
    fingerprinter: &Fingerprinter,
    normalize: bool,
    pb: &ProgressBar,
) -> Result<IngestSummary, IngestError> {
    let mut summary = IngestSummary::default();
    let mut writer = index.writer()?;

    for track_id in track_ids {
        pb.inc(1);
        let chroma = match source.load(track_id) {
            Ok(Some(c)) => c,
            Ok(None) => {
                log::warn!("{}: no chroma available, skipping", track_id);
                summary.skipped += 1;
                continue;
            }
            Err(e) => {
                log::warn!("{}: {}", track_id, e);
                summary.failed += 1;
                continue;
            }
        };

        match index_track(&mut writer, fingerprinter, track_id, &chroma, normalize)? {
            InsertOutcome::Indexed { .. } => summary.indexed += 1,
            InsertOutcome::NoFingerprint => summary.no_fingerprint += 1,
            InsertOutcome::AlreadyIndexed | InsertOutcome::DegenerateWeights => summary.skipped += 1,
        }
    }

    Ok(summary)
}
