use std::path::{Path, PathBuf};

use picgrab_engine::{CacheType, ImageManager, LoadOptions, LoadedImage};
use tracing::{debug, info};

use crate::error::AppError;
use crate::utils::format_bytes;

fn provenance(cache_type: CacheType) -> &'static str {
    match cache_type {
        CacheType::None => "network",
        CacheType::Memory => "memory",
        CacheType::Disk => "disk",
    }
}

/// File name for a loaded image: the hashed key plus the decoded format's extension.
fn output_path(dir: &Path, loaded: &LoadedImage) -> PathBuf {
    let mut name = loaded.key.to_filename();
    if let Some(ext) = loaded
        .image
        .format()
        .and_then(|format| format.extensions_str().first().copied())
    {
        name.push('.');
        name.push_str(ext);
    }
    dir.join(name)
}

/// Load every URL, print where each image came from and optionally save it.
pub async fn run(
    manager: &ImageManager,
    urls: &[String],
    out: Option<&Path>,
    options: LoadOptions,
) -> Result<(), AppError> {
    if let Some(dir) = out {
        tokio::fs::create_dir_all(dir).await?;
    }

    // Start everything first; the downloader bounds concurrency
    let handles: Vec<_> = urls
        .iter()
        .map(|url| (url, manager.load(url, options)))
        .collect();

    let mut failed = 0;
    for (url, mut handle) in handles {
        let mut delivered = false;
        while let Some(result) = handle.next().await {
            delivered = true;
            match result {
                Ok(loaded) => {
                    println!(
                        "{url}: {}x{} from {} ({})",
                        loaded.image.width(),
                        loaded.image.height(),
                        provenance(loaded.cache_type),
                        format_bytes(loaded.data.len() as u64)
                    );
                    if let Some(dir) = out {
                        let path = output_path(dir, &loaded);
                        tokio::fs::write(&path, &loaded.data).await?;
                        debug!(path = %path.display(), "Saved image");
                    }
                }
                Err(e) => {
                    eprintln!("{url}: {e}");
                    failed += 1;
                }
            }
        }
        if !delivered {
            debug!(url, "Load ended without a result");
        }
    }

    info!(total = urls.len(), failed, "Fetch finished");
    if failed > 0 {
        return Err(AppError::LoadFailed(failed, urls.len()));
    }
    Ok(())
}
