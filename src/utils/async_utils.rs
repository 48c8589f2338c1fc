//! Helpers for managing async tasks.

use tokio::task::{JoinError, JoinHandle};

/// RAII guard that aborts a Tokio task when dropped.
///
/// Useful for ensuring background tasks do not outlive their scope.
#[must_use]
pub struct AbortOnDrop<T> {
    handle: Option<JoinHandle<T>>,
}

impl<T> AbortOnDrop<T> {
    /// Create a new AbortOnDrop from a JoinHandle.
    pub fn new(handle: JoinHandle<T>) -> Self {
        Self {
            handle: Some(handle),
        }
    }

    /// Abort the task immediately.
    pub fn abort(self) {
        self.as_handle().abort();
    }

    /// Wait for the task to finish and return its result.
    pub async fn join(self) -> Result<T, JoinError> {
        self.as_handle().await
    }

    /// Take the original join handle (internal use).
    pub fn as_handle(mut self) -> JoinHandle<T> {
        // The handle should be there, because it's only removed by
        // drop.
        self.handle.take().expect("missing handle")
    }
}

impl<T> Drop for AbortOnDrop<T> {
    #[inline]
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}
