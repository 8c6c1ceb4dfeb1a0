use std::sync::Arc;

use picgrab_engine::{ImageManager, PrefetchProgress, Prefetcher, PrefetcherConfig};
use tracing::info;

use crate::error::AppError;
use crate::utils::progress::PrefetchProgressBar;

/// Warm the cache for `urls` and print the batch counts.
pub async fn run(
    manager: ImageManager,
    urls: Vec<String>,
    concurrency: usize,
    show_progress: bool,
) -> Result<(), AppError> {
    let config = PrefetcherConfig {
        max_concurrent_prefetches: concurrency,
        ..PrefetcherConfig::default()
    };
    let prefetcher = Prefetcher::with_config(manager, config)?;

    let bar = if show_progress {
        PrefetchProgressBar::new(urls.len())
    } else {
        PrefetchProgressBar::hidden(urls.len())
    };
    let progress_bar = bar.clone();
    let progress: PrefetchProgress =
        Arc::new(move |finished, _total| progress_bar.update(finished));

    let report = prefetcher
        .prefetch_with_progress(urls, Some(progress))
        .finished()
        .await;
    bar.finish(report.finished, report.skipped);

    info!(
        total = report.total,
        finished = report.finished,
        skipped = report.skipped,
        "Prefetch finished"
    );
    println!(
        "finished: {}, skipped: {}, total: {}",
        report.finished, report.skipped, report.total
    );
    Ok(())
}
