use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

fn prefetch_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template("{spinner:.green} {msg}\n[{elapsed_precise}] [{bar:40.green/white}] {pos}/{len} images")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=> ")
}

/// Progress bar of a prefetch batch.
#[derive(Clone)]
pub struct PrefetchProgressBar {
    bar: ProgressBar,
}

impl PrefetchProgressBar {
    pub fn new(total: usize) -> Self {
        let bar = ProgressBar::new(total as u64);
        bar.set_style(prefetch_style());
        bar.set_message("Prefetching");
        bar.enable_steady_tick(Duration::from_millis(500));
        Self { bar }
    }

    /// A bar that draws nothing.
    pub fn hidden(total: usize) -> Self {
        let bar = ProgressBar::hidden();
        bar.set_length(total as u64);
        Self { bar }
    }

    pub fn update(&self, finished: usize) {
        self.bar.set_position(finished as u64);
    }

    pub fn finish(&self, finished: usize, skipped: usize) {
        self.bar
            .finish_with_message(format!("Done: {finished} finished, {skipped} skipped"));
    }
}
