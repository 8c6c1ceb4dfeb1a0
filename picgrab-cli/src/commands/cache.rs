use picgrab_engine::ImageCache;
use tracing::info;

use crate::error::AppError;
use crate::utils::format_bytes;

pub async fn size(cache: &ImageCache) -> Result<(), AppError> {
    let size = cache.calculate_size().await;
    println!(
        "{}: {} files, {}",
        cache.disk().root().display(),
        size.file_count,
        format_bytes(size.total_bytes)
    );
    Ok(())
}

pub async fn clean(cache: &ImageCache) -> Result<(), AppError> {
    let report = cache.clean_disk().await?;
    info!(
        removed = report.removed_count,
        freed = report.freed_bytes,
        "Disk cache cleaned"
    );
    println!(
        "removed {} files, freed {}",
        report.removed_count,
        format_bytes(report.freed_bytes)
    );
    Ok(())
}

pub async fn clear(cache: &ImageCache) -> Result<(), AppError> {
    cache.clear_disk().await?;
    println!("cleared {}", cache.disk().root().display());
    Ok(())
}
