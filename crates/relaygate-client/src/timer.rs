//! Single-shot cancellable timers.
//!
//! A [`Timer`] owns a spawned task that sleeps and then runs its callback.
//! Cancelling or dropping the handle aborts the task, so an owner that
//! discards its timer can never see it fire afterwards.

use std::time::Duration;

use tokio::task::JoinHandle;

pub struct Timer {
    handle: JoinHandle<()>,
}

impl Timer {
    /// Run `on_expiry` once after `after` has elapsed.
    pub fn start<F>(after: Duration, on_expiry: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            on_expiry();
        });
        Self { handle }
    }

    pub fn cancel(self) {
        self.handle.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

impl std::fmt::Debug for Timer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Timer")
            .field("finished", &self.handle.is_finished())
            .finish()
    }
}
