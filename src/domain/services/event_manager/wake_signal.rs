use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Notify;

/// Pending-wake flag shared between arrival handlers and the matching loop.
///
/// Any number of `notify` calls made while the loop is busy collapse into a single
/// pending wake, since one matching pass drains everything that can match.
#[derive(Debug, Default)]
pub struct WakeSignal {
    pending: AtomicBool,
    notify: Notify,
}

impl WakeSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks a wake as pending. Never blocks.
    pub fn notify(&self) {
        self.pending.store(true, Ordering::Release);
        self.notify.notify_one();
    }

    /// Whether a wake is pending and not yet consumed.
    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }

    /// Consumes the pending wake, if any.
    pub fn take(&self) -> bool {
        self.pending.swap(false, Ordering::AcqRel)
    }

    /// Waits until a wake is pending and consumes it.
    pub async fn wait(&self) {
        loop {
            if self.take() {
                return;
            }
            self.notify.notified().await;
        }
    }
}
