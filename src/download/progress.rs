//! Progress reporting seam for the download manager.

/// One item finished, successfully or not.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressEvent {
    /// Items finished so far, including this one.
    pub completed: usize,
    /// Items scheduled for download in this batch.
    pub total: usize,
    /// The finished item.
    pub item_id: String,
    /// Bytes written, when the download succeeded.
    pub bytes: Option<u64>,
}

impl ProgressEvent {
    /// Whether the item was downloaded.
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.bytes.is_some()
    }
}

/// Receives progress as items complete.
///
/// Called from worker tasks, so implementations must be thread-safe.
pub trait ProgressObserver: Send + Sync {
    /// The batch is starting with `total` items to download.
    fn on_start(&self, total: usize);

    /// An item finished.
    fn on_item(&self, event: &ProgressEvent);

    /// The batch is over.
    fn on_finish(&self) {}
}

/// Observer that ignores every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl ProgressObserver for NoopObserver {
    fn on_start(&self, _total: usize) {}

    fn on_item(&self, _event: &ProgressEvent) {}
}
