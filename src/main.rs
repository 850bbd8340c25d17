use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use coverprint::chroma::source::{read_chroma_file, ChromaSource, JsonChromaDir};
use coverprint::db::Database;
use coverprint::fingerprint::Fingerprinter;
use coverprint::index::{weigh_codes, FingerprintIndex};
use coverprint::matcher::{select_matches, MatchCandidate, QuerySource};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "coverprint", version, about = "Cover song fingerprinting and search")]
struct Cli {
    /// Path to the SQLite database
    #[arg(long, global = true)]
    db_path: Option<PathBuf>,

    /// Verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fingerprint a directory of chroma files into the index
    Index {
        /// Directory of <track_id>.json chroma files (defaults to config chroma_dir)
        chroma_dir: Option<PathBuf>,

        /// Number of parallel workers (0 = auto-detect from config)
        #[arg(short = 'j', long, default_value = "0")]
        jobs: usize,
    },

    /// Find probable covers of an indexed track or a chroma file
    Query {
        /// Indexed track id to query with
        #[arg(required_unless_present = "chroma", conflicts_with = "chroma")]
        track_id: Option<String>,

        /// Fingerprint this chroma file and query with it instead
        #[arg(long)]
        chroma: Option<PathBuf>,

        /// Weight tolerance (defaults to config query.weight_margin)
        #[arg(short, long)]
        margin: Option<f64>,

        /// Number of results
        #[arg(short = 'n', long, default_value = "20")]
        limit: usize,
    },

    /// Rebuild the lookup indexes of every shard
    Reindex,

    /// Copy every track of other index databases into this one
    Merge {
        /// Index databases to merge, in order
        #[arg(required = true)]
        sources: Vec<PathBuf>,
    },

    /// Query every member of a cover list and report where its covers rank
    Evaluate {
        /// Cover list (SHS format)
        cover_list: PathBuf,

        /// Number of parallel workers (0 = auto-detect from config)
        #[arg(short = 'j', long, default_value = "0")]
        jobs: usize,

        /// Weight tolerance (defaults to config query.weight_margin)
        #[arg(short, long)]
        margin: Option<f64>,

        /// Write every (query, target, position) record here as JSON
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show index statistics
    Stats,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let log_level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level))
        .format_timestamp(None)
        .init();

    // Load config file (optional, defaults if missing)
    let config = coverprint::config::AppConfig::load();

    // Resolve database path: CLI > config > XDG default
    let db_path = cli
        .db_path
        .or(config.db_path.clone())
        .unwrap_or_else(coverprint::config::default_db_path);
    log::info!("Database: {}", db_path.display());

    let db = Database::open(&db_path).context("Failed to open database")?;
    let ceiling = config.index.shard_row_ceiling;

    match cli.command {
        Commands::Index { chroma_dir, jobs } => {
            let dir = chroma_dir.or(config.chroma_dir.clone()).context(
                "No chroma directory. Pass it as an argument or set chroma_dir in config.",
            )?;
            let source = JsonChromaDir::open(&dir)
                .with_context(|| format!("Failed to read {}", dir.display()))?;
            let track_ids = source.track_ids()?;

            let fingerprinter =
                Fingerprinter::new(&config.fingerprint).context("Invalid fingerprint settings")?;
            let mut index = FingerprintIndex::open(db, ceiling).context("Failed to open index")?;

            let workers = if jobs > 0 { jobs } else { config.resolve_workers() };
            let result = coverprint::ingest::ingest_parallel(
                &mut index,
                &source,
                &track_ids,
                &fingerprinter,
                config.fingerprint.normalize,
                workers,
            )
            .context("Indexing failed")?;
            println!(
                "Index complete: {} indexed, {} without fingerprint, {} skipped, {} failed",
                result.indexed, result.no_fingerprint, result.skipped, result.failed
            );
        }

        Commands::Query { track_id, chroma, margin, limit } => {
            let index = FingerprintIndex::open(db, ceiling).context("Failed to open index")?;
            let margin = margin.unwrap_or(config.query.weight_margin);

            let matches = match (track_id, chroma) {
                (Some(id), _) => {
                    println!("Covers of {}:", id);
                    select_matches(&index, QuerySource::Track(&id), margin)?
                }
                (None, Some(path)) => {
                    let chroma = read_chroma_file(&path)
                        .with_context(|| format!("Failed to read {}", path.display()))?;
                    let fingerprinter = Fingerprinter::new(&config.fingerprint)
                        .context("Invalid fingerprint settings")?;
                    let codes = fingerprinter.fingerprint(&chroma)?;
                    let weighted = weigh_codes(&codes, config.fingerprint.normalize)
                        .context("Fingerprint has a single code, nothing to match")?;
                    println!("Covers of {} ({} codes):", path.display(), weighted.len());
                    select_matches(&index, QuerySource::Codes(&weighted), margin)?
                }
                (None, None) => anyhow::bail!("Pass a track id or --chroma"),
            };

            if matches.is_empty() {
                println!("No matches found.");
                return Ok(());
            }
            println!();
            print_matches(&matches[..matches.len().min(limit)]);
        }

        Commands::Reindex => {
            let mut index = FingerprintIndex::open(db, ceiling).context("Failed to open index")?;
            index.reindex().context("Reindex failed")?;
            println!("Reindexed {} shards", index.shard_count());
        }

        Commands::Merge { sources } => {
            let mut index = FingerprintIndex::open(db, ceiling).context("Failed to open index")?;
            for path in &sources {
                let other = Database::open_read_only(path)
                    .with_context(|| format!("Failed to open {}", path.display()))?;
                let other = FingerprintIndex::open(other, u64::MAX)?;
                let merged = index
                    .merge_from(&other)
                    .with_context(|| format!("Failed to merge {}", path.display()))?;
                println!("{}: {} of {} tracks merged", path.display(), merged, other.track_count());
            }
            index.reindex().context("Reindex failed")?;
        }

        Commands::Evaluate { cover_list, jobs, margin, output } => {
            // Workers open their own read-only connections.
            drop(db);
            let cliques = coverprint::evaluate::read_cover_list(&cover_list)
                .with_context(|| format!("Failed to read {}", cover_list.display()))?;
            let margin = margin.unwrap_or(config.query.weight_margin);
            let workers = if jobs > 0 { jobs } else { config.resolve_workers() };

            let records =
                coverprint::evaluate::evaluate_parallel(&db_path, &cliques, margin, workers)
                    .context("Evaluation failed")?;
            let summary = coverprint::evaluate::summarize(&records);

            if let Some(path) = output {
                let json = serde_json::to_string_pretty(&records)?;
                std::fs::write(&path, json)
                    .with_context(|| format!("Failed to write {}", path.display()))?;
                log::info!("Wrote {} records to {}", records.len(), path.display());
            }

            println!("Evaluation ({} cliques, margin {}):", cliques.len(), margin);
            println!("  Queries:      {}", summary.queries);
            println!("  Mean rank:    {:.1}", summary.mean_position);
            println!("  Not matched:  {}", summary.not_matched);
            println!("  Top-1 rate:   {:.1}%", summary.top1_rate * 100.0);
        }

        Commands::Stats => {
            let index = FingerprintIndex::open(db, ceiling).context("Failed to open index")?;
            let stats = index.stats()?;
            println!("Index Statistics");
            println!("================");
            println!("  Tracks:          {}", stats.tracks);
            println!("  Shards:          {}", stats.shards);
            println!("  Entries:         {}", stats.entries);
            println!("  Distinct codes:  {}", stats.distinct_codes);
            if stats.tracks > 0 {
                println!(
                    "  Codes per track: {:.1}",
                    stats.entries as f64 / stats.tracks as f64
                );
            }
        }
    }

    Ok(())
}

fn print_matches(matches: &[MatchCandidate]) {
    println!("{:>4}  {:<24} {:>7} {:>8}", "#", "Track", "Score", "Rotation");
    println!("{}", "-".repeat(48));
    for (i, m) in matches.iter().enumerate() {
        println!(
            "{:>4}  {:<24} {:>7} {:>8}",
            i + 1,
            m.track_id,
            m.score,
            m.rotation
        );
    }
}
