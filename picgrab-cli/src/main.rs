use std::io::IsTerminal;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use picgrab_engine::{
    CacheConfig, Downloader, DownloaderConfig, ExecutionOrder, ImageCache, ImageManager,
    LoadOptions,
};
use tracing::{Level, error, info};
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

mod cli;
mod commands;
mod error;
mod utils;

use cli::{CliArgs, Commands};
use error::AppError;
use utils::{parse_duration, parse_headers, parse_size};

fn main() {
    if let Err(e) = bootstrap() {
        eprintln!("Error: {e}");
        error!(error = ?e, "Application failed");
        std::process::exit(1);
    }
}

fn init_logging(verbose: bool) -> Result<(), AppError> {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env().add_directive(Level::WARN.into())
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .try_init()
        .map_err(|e| AppError::Initialization(e.to_string()))
}

fn cache_config(args: &CliArgs) -> Result<CacheConfig, AppError> {
    let max_cache_age = parse_duration(&args.max_cache_age)?;
    Ok(CacheConfig {
        disk_cache_path: args.cache_dir.clone(),
        max_cache_age: (!max_cache_age.is_zero()).then_some(max_cache_age),
        max_cache_size: parse_size(&args.max_cache_size)?,
        ..CacheConfig::default()
    })
}

fn downloader_config(args: &CliArgs) -> Result<DownloaderConfig, AppError> {
    let order = if args.lifo {
        ExecutionOrder::Lifo
    } else {
        ExecutionOrder::Fifo
    };

    let mut headers = DownloaderConfig::get_default_headers();
    headers.extend(parse_headers(&args.headers));

    let config = DownloaderConfig::builder()
        .with_max_concurrent_downloads(args.max_concurrent_downloads)
        .with_execution_order(order)
        .with_download_timeout(Duration::from_secs(args.timeout))
        .with_headers(headers)
        .build()?;
    Ok(config)
}

#[tokio::main]
async fn bootstrap() -> Result<(), AppError> {
    let args = CliArgs::parse();
    init_logging(args.verbose)?;

    let cache = Arc::new(ImageCache::new(cache_config(&args)?)?);
    info!(root = %cache.disk().root().display(), "Using disk cache");

    let manager = || -> Result<ImageManager, AppError> {
        let downloader = Downloader::new(downloader_config(&args)?)?;
        Ok(ImageManager::new(cache.clone(), downloader))
    };

    match &args.command {
        Commands::Fetch {
            urls,
            out,
            memory_only,
            refresh,
            retry_failed,
        } => {
            let options = LoadOptions {
                memory_only: *memory_only,
                refresh_cached: *refresh,
                retry_failed: *retry_failed,
                ..LoadOptions::default()
            };
            commands::fetch::run(&manager()?, urls, out.as_deref(), options).await
        }
        Commands::Prefetch { urls, concurrency } => {
            let show_progress = std::io::stderr().is_terminal();
            commands::prefetch::run(manager()?, urls.clone(), *concurrency, show_progress).await
        }
        Commands::Size => commands::cache::size(&cache).await,
        Commands::Clean => commands::cache::clean(&cache).await,
        Commands::Clear => commands::cache::clear(&cache).await,
    }
}
