//! Progress bar for download runs.

use std::time::Duration;

use harvester_core::{ProgressEvent, ProgressObserver};
use indicatif::{ProgressBar, ProgressStyle};

/// Renders download progress as an `indicatif` bar.
pub(crate) struct BarObserver {
    bar: ProgressBar,
}

impl BarObserver {
    /// A bar drawn to stderr, or a hidden one when `enabled` is false.
    pub(crate) fn new(enabled: bool) -> Self {
        let bar = if enabled {
            ProgressBar::new(0)
        } else {
            ProgressBar::hidden()
        };
        bar.set_style(
            ProgressStyle::with_template("{spinner} [{pos}/{len}] {wide_bar} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );
        Self { bar }
    }
}

impl ProgressObserver for BarObserver {
    fn on_start(&self, total: usize) {
        self.bar.set_length(total as u64);
        self.bar.enable_steady_tick(Duration::from_millis(120));
    }

    fn on_item(&self, event: &ProgressEvent) {
        self.bar.set_position(event.completed as u64);
        let message = match event.bytes {
            Some(bytes) => format!("{} ({} KiB)", event.item_id, bytes / 1024),
            None => format!("{} failed", event.item_id),
        };
        self.bar.set_message(message);
    }

    fn on_finish(&self) {
        self.bar.finish_and_clear();
    }
}
