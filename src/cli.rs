use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// jobgrid cli
#[derive(Parser)]
#[command(name = "jobgrid")]
#[command(about = "Fault-tolerant job-listing ingestion pipeline with a searchable local store")]
#[command(version)]
pub struct Cli {
    /// Path to a TOML settings file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run one full crawl over the configured seed URLs
    Crawl {
        /// Seed listing URLs (overrides the settings file)
        #[arg(short, long)]
        seed_url: Vec<String>,

        /// Maximum pages per seed
        #[arg(long)]
        max_pages: Option<u32>,

        /// Disable the incremental early-stop policy for this run
        #[arg(long)]
        forced: bool,

        /// Output formats: json, csv, text
        #[arg(short, long)]
        format: Vec<String>,
    },

    /// Search the cache index without touching blob files
    Search {
        /// Company filter; repeatable, values combine with OR
        #[arg(long)]
        company: Vec<String>,

        /// Technology filter; repeatable, values combine with OR
        #[arg(long)]
        tech: Vec<String>,

        /// Location filter; repeatable, values combine with OR
        #[arg(long)]
        location: Vec<String>,

        /// Seniority filter; repeatable, values combine with OR
        #[arg(long)]
        level: Vec<String>,

        /// Only entries holding at least this many jobs
        #[arg(long)]
        min_jobs: Option<usize>,

        /// Earliest capture date (YYYY-MM-DD)
        #[arg(long)]
        date_from: Option<chrono::NaiveDate>,

        /// Latest capture date (YYYY-MM-DD)
        #[arg(long)]
        date_to: Option<chrono::NaiveDate>,
    },

    /// Companies ranked by blob count
    TopCompanies {
        #[arg(short, long, default_value = "10")]
        k: usize,
    },

    /// Technologies ranked by blob count
    TopTechnologies {
        #[arg(short, long, default_value = "10")]
        k: usize,
    },

    /// Deduplicate a JSON job file in place (a .bak sibling keeps the original)
    DedupeFile {
        /// File holding a job array or {"jobs": [...]}
        path: PathBuf,
    },

    /// Remove cache blobs older than the given age
    PruneCache {
        /// Age threshold in hours
        #[arg(long, default_value = "168")]
        max_age_hours: u64,
    },

    /// Truncate the incremental checkpoint; the next run re-ingests everything
    ResetCheckpoint,
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
