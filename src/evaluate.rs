//! Cover-clique evaluation.
//!
//! Every member of every clique queries the index by track id; for each other
//! member of its clique we record where it landed in the ranking.

use std::path::Path;

use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;
use serde::Serialize;
use thiserror::Error;

use crate::db::{Database, DbError, FingerprintStore};
use crate::index::{FingerprintIndex, IndexError};
use crate::matcher::{ranked_track_ids, QueryError, QuerySource};

#[derive(Error, Debug)]
pub enum EvalError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Database error: {0}")]
    Db(#[from] DbError),
    #[error("Index error: {0}")]
    Index(#[from] IndexError),
    #[error("Query error: {0}")]
    Query(#[from] QueryError),
    #[error("Thread pool error: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),
}

/// A set of recordings of the same work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Clique {
    pub name: String,
    pub track_ids: Vec<String>,
}

/// Parse a cover list: `#` comments, `%` clique headers, and member lines
/// whose first `<SEP>`-separated field is the track id.
pub fn parse_cover_list(text: &str) -> Vec<Clique> {
    let mut cliques: Vec<Clique> = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if line.starts_with('%') {
            cliques.push(Clique {
                name: line.to_string(),
                track_ids: Vec::new(),
            });
            continue;
        }
        let tid = line.split("<SEP>").next().unwrap_or(line).trim();
        match cliques.last_mut() {
            Some(clique) => clique.track_ids.push(tid.to_string()),
            None => log::warn!("Track {} listed before any clique header, ignoring", tid),
        }
    }
    cliques
}

pub fn read_cover_list(path: &Path) -> Result<Vec<Clique>, EvalError> {
    let text = std::fs::read_to_string(path)?;
    let cliques = parse_cover_list(&text);
    let members: usize = cliques.iter().map(|c| c.track_ids.len()).sum();
    log::info!(
        "Found {} cliques for a total of {} tracks in {}",
        cliques.len(),
        members,
        path.display()
    );
    Ok(cliques)
}

/// Where one known cover landed for one query.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EvalRecord {
    pub query: String,
    pub target: String,
    /// 0-based rank. Unmatched targets are charged the expected rank of a
    /// random ordering of the unranked tracks.
    pub position: u64,
    pub n_results: usize,
    pub matched: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct EvalSummary {
    pub queries: usize,
    pub mean_position: f64,
    pub not_matched: usize,
    /// Share of queries whose target ranked first.
    pub top1_rate: f64,
}

/// Query every clique member against `index`.
pub fn evaluate_cliques<S: FingerprintStore>(
    index: &FingerprintIndex<S>,
    cliques: &[Clique],
    weight_margin: f64,
    pb: &ProgressBar,
) -> Result<Vec<EvalRecord>, EvalError> {
    let total = index.track_count() as u64;
    let mut records = Vec::new();

    for clique in cliques {
        for query in &clique.track_ids {
            let ranked = match ranked_track_ids(index, QuerySource::Track(query), weight_margin) {
                Ok(r) => r,
                Err(QueryError::UnknownTrack(_)) => {
                    log::warn!("{} is not indexed, all its covers count as unmatched", query);
                    Vec::new()
                }
                Err(e) => return Err(e.into()),
            };
            if ranked.is_empty() {
                log::debug!("No matches for {}", query);
            }

            for target in clique.track_ids.iter().filter(|t| *t != query) {
                let found = ranked.iter().position(|id| id == target);
                let n = ranked.len() as u64;
                let position = match found {
                    Some(p) => p as u64,
                    None => n + total.saturating_sub(n) / 2,
                };
                records.push(EvalRecord {
                    query: query.clone(),
                    target: target.clone(),
                    position,
                    n_results: ranked.len(),
                    matched: found.is_some(),
                });
            }
        }
        pb.inc(1);
    }

    Ok(records)
}

/// Split `cliques` into `jobs` contiguous slices, evaluate each on its own
/// read-only connection to the finished index at `db_path`, and concatenate
/// the records in clique order.
pub fn evaluate_parallel(
    db_path: &Path,
    cliques: &[Clique],
    weight_margin: f64,
    jobs: usize,
) -> Result<Vec<EvalRecord>, EvalError> {
    if cliques.is_empty() {
        return Ok(Vec::new());
    }
    let jobs = jobs.max(1);
    let slice_len = cliques.len().div_ceil(jobs);

    let pb = ProgressBar::new(cliques.len() as u64);
    pb.set_style(
        ProgressStyle::with_template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} cliques ({eta} remaining)")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=>-"),
    );

    let pool = rayon::ThreadPoolBuilder::new().num_threads(jobs).build()?;
    let per_worker: Vec<Vec<EvalRecord>> = pool.install(|| {
        cliques
            .par_chunks(slice_len)
            .map(|slice| -> Result<_, EvalError> {
                let db = Database::open_read_only(db_path)?;
                // Read-only: the ceiling never comes into play.
                let index = FingerprintIndex::open(db, u64::MAX)?;
                evaluate_cliques(&index, slice, weight_margin, &pb)
            })
            .collect::<Result<Vec<_>, EvalError>>()
    })?;
    pb.finish_with_message("done");

    Ok(per_worker.into_iter().flatten().collect())
}

pub fn summarize(records: &[EvalRecord]) -> EvalSummary {
    let queries = records.len();
    if queries == 0 {
        return EvalSummary {
            queries: 0,
            mean_position: 0.0,
            not_matched: 0,
            top1_rate: 0.0,
        };
    }
    let sum: u64 = records.iter().map(|r| r.position).sum();
    let not_matched = records.iter().filter(|r| !r.matched).count();
    let top1 = records.iter().filter(|r| r.matched && r.position == 0).count();
    EvalSummary {
        queries,
        mean_position: sum as f64 / queries as f64,
        not_matched,
        top1_rate: top1 as f64 / queries as f64,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chroma::ChromaMatrix;
    use crate::fingerprint::tests::{melody_chroma, test_melody, uncompressed};
    use crate::fingerprint::Fingerprinter;
    use crate::ingest::ingest;
    use crate::index::DEFAULT_SHARD_CEILING;
    use std::collections::BTreeMap;

    const COVER_LIST: &str = "\
# Second Hand Songs style list
# comment lines are skipped
%-1,11,A,%Song One
TRA<SEP>ARX<SEP>1
TRB<SEP>ARY<SEP>2

%-1,12,%Song Two
TRC<SEP>ARZ<SEP>3
TRD<SEP>ARW<SEP>4
TRNOTINDEXED<SEP>ARV<SEP>5
";

    #[test]
    fn test_parse_cover_list() {
        let cliques = parse_cover_list(COVER_LIST);
        assert_eq!(cliques.len(), 2);
        assert_eq!(cliques[0].name, "%-1,11,A,%Song One");
        assert_eq!(cliques[0].track_ids, vec!["TRA", "TRB"]);
        assert_eq!(cliques[1].track_ids, vec!["TRC", "TRD", "TRNOTINDEXED"]);
    }

    #[test]
    fn test_members_before_header_are_ignored() {
        let cliques = parse_cover_list("TRX<SEP>A<SEP>1\n%h\nTRY\n");
        assert_eq!(cliques.len(), 1);
        assert_eq!(cliques[0].track_ids, vec!["TRY"]);
    }

    fn build_db(path: &Path) {
        let mut lib: BTreeMap<String, ChromaMatrix> = BTreeMap::new();
        lib.insert("TRA".into(), melody_chroma(&test_melody(10)));
        lib.insert("TRB".into(), melody_chroma(&test_melody(10)).transpose(3));
        lib.insert("TRC".into(), melody_chroma(&test_melody(11)));
        lib.insert("TRD".into(), melody_chroma(&test_melody(11)).transpose(9));
        lib.insert("TRE".into(), melody_chroma(&test_melody(12)));
        lib.insert("TRF".into(), melody_chroma(&test_melody(13)));

        let fp = Fingerprinter::new(&uncompressed()).unwrap();
        let mut index = FingerprintIndex::open(Database::open(path).unwrap(), DEFAULT_SHARD_CEILING).unwrap();
        let ids: Vec<String> = lib.keys().cloned().collect();
        ingest(&mut index, &lib, &ids, &fp, true).unwrap();
    }

    #[test]
    fn test_covers_rank_first() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.db");
        build_db(&path);

        let cliques = parse_cover_list(COVER_LIST);
        let records = evaluate_parallel(&path, &cliques, 0.6, 2).unwrap();

        // 2 + 6 (query, target) pairs
        assert_eq!(records.len(), 8);
        let find = |q: &str, t: &str| records.iter().find(|r| r.query == q && r.target == t).unwrap();
        assert_eq!(find("TRA", "TRB").position, 0);
        assert_eq!(find("TRB", "TRA").position, 0);
        assert_eq!(find("TRC", "TRD").position, 0);
        assert_eq!(find("TRD", "TRC").position, 0);

        // An unindexed target is charged n + (total - n) / 2
        let missing = find("TRC", "TRNOTINDEXED");
        assert!(!missing.matched);
        let n = missing.n_results as u64;
        assert_eq!(missing.position, n + (6 - n) / 2);

        // An unindexed query has no results at all
        let lost = find("TRNOTINDEXED", "TRC");
        assert_eq!(lost.n_results, 0);
        assert_eq!(lost.position, 3);

        let summary = summarize(&records);
        assert_eq!(summary.queries, 8);
        assert_eq!(summary.not_matched, 4);
        assert_eq!(summary.top1_rate, 0.5);
    }

    #[test]
    fn test_parallel_matches_single_worker() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.db");
        build_db(&path);
        let cliques = parse_cover_list(COVER_LIST);

        let one = evaluate_parallel(&path, &cliques, 0.6, 1).unwrap();
        let many = evaluate_parallel(&path, &cliques, 0.6, 4).unwrap();
        assert_eq!(one, many);
    }

    #[test]
    fn test_summary_of_nothing() {
        assert_eq!(summarize(&[]).queries, 0);
    }
}
