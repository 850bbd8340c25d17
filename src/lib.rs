pub mod chroma;
pub mod config;
pub mod db;
pub mod evaluate;
pub mod fingerprint;
pub mod index;
pub mod ingest;
pub mod jumps;
pub mod landmarks;
pub mod matcher;

/// Application name for XDG paths
pub const APP_NAME: &str = "coverprint";
