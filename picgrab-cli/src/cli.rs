use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Define CLI arguments
#[derive(Parser, Debug)]
#[command(
    name = "picgrab",
    version,
    about = "Remote image fetcher with a persistent cache",
    long_about = "Fetch and prefetch remote images through a deduplicating downloader\n\
                  backed by a memory and disk cache, and maintain the disk cache."
)]
pub struct CliArgs {
    #[command(subcommand)]
    pub command: Commands,

    /// Disk cache directory
    #[arg(
        long,
        global = true,
        help = "Directory of the disk cache (default: <tmp>/picgrab-cache)"
    )]
    pub cache_dir: Option<PathBuf>,

    /// Maximum disk cache size with optional unit (B, KB, MB, GB, TB)
    #[arg(
        long,
        global = true,
        default_value = "0",
        help = "Maximum size of the disk cache with optional unit (B, KB, MB, GB, TB). Examples: \"500MB\", \"2GB\". Use 0 for unlimited."
    )]
    pub max_cache_size: String,

    /// Maximum age of disk cache entries with optional unit (s, m, h, d)
    #[arg(
        long,
        global = true,
        default_value = "7d",
        help = "Maximum age of disk cache entries with optional unit (s, m, h, d). Examples: \"12h\", \"7d\". Use 0 for no age limit."
    )]
    pub max_cache_age: String,

    /// Number of concurrent downloads
    #[arg(
        long,
        global = true,
        default_value = "6",
        help = "Maximum number of downloads running at the same time"
    )]
    pub max_concurrent_downloads: usize,

    /// Start the most recently queued download first
    #[arg(long, global = true, help = "Run queued downloads last-in first-out")]
    pub lifo: bool,

    /// Per-request timeout in seconds
    #[arg(
        long,
        global = true,
        default_value = "15",
        help = "Timeout in seconds for each download. Use 0 to disable."
    )]
    pub timeout: u64,

    /// Custom HTTP headers for download requests
    #[arg(
        long = "header",
        short = 'H',
        global = true,
        help = "Add custom HTTP header to requests (can be used multiple times). Format: 'Name: Value'",
        value_name = "HEADER"
    )]
    pub headers: Vec<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true, help = "Enable detailed debug logging")]
    pub verbose: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Load images through the cache and report where each came from
    Fetch {
        /// URLs of the images to load
        #[arg(required = true)]
        urls: Vec<String>,

        /// Write the raw image bytes into this directory
        #[arg(short, long)]
        out: Option<PathBuf>,

        /// Skip the disk cache for reads and writes
        #[arg(long)]
        memory_only: bool,

        /// Revalidate cached images against the origin
        #[arg(long)]
        refresh: bool,

        /// Retry URLs that failed earlier
        #[arg(long)]
        retry_failed: bool,
    },

    /// Warm the disk cache for a batch of URLs
    Prefetch {
        /// URLs of the images to prefetch
        #[arg(required = true)]
        urls: Vec<String>,

        /// Number of URLs loaded at the same time
        #[arg(long, default_value = "3")]
        concurrency: usize,
    },

    /// Show the number of files and bytes in the disk cache
    Size,

    /// Remove expired entries and trim the disk cache to its size limit
    Clean,

    /// Remove every entry from the disk cache
    Clear,
}
