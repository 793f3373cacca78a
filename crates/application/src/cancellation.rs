use std::sync::Arc;

use tokio::sync::watch;

/// Shared, cooperative cancellation flag with wake-up notification.
///
/// Clones observe the same flag. Cancellation is sticky; the flag never
/// resets. At any time one party is expected to own the right to cancel: the
/// consumer normally, a lease manager only when its lease expires.
#[derive(Debug, Clone)]
pub struct CancellationSignal {
    state: Arc<watch::Sender<bool>>,
}

impl CancellationSignal {
    /// Creates an uncancelled signal.
    #[must_use]
    pub fn new() -> Self {
        let (sender, _) = watch::channel(false);
        Self {
            state: Arc::new(sender),
        }
    }

    /// Requests cancellation. Returns `true` when this call flipped the flag.
    pub fn cancel(&self) -> bool {
        !self.state.send_replace(true)
    }

    /// Returns whether cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.state.borrow()
    }

    /// Waits until cancellation is requested.
    pub async fn cancelled(&self) {
        let mut receiver = self.state.subscribe();
        // The sender lives as long as `self`, so waiting cannot fail.
        let _ = receiver.wait_for(|cancelled| *cancelled).await;
    }
}

impl Default for CancellationSignal {
    fn default() -> Self {
        Self::new()
    }
}
