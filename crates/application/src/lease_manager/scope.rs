use std::sync::Arc;

use mqlease_domain::DispositionAction;
use tracing::{debug, warn};

use super::LeaseManager;

impl LeaseManager {
    /// Runs `work` against this lease, then releases it on the way out.
    ///
    /// If `work` returns without disposing of the message, the message is
    /// abandoned before this returns.
    pub async fn scoped<T>(self, work: impl AsyncFnOnce(&LeaseManager) -> T) -> T {
        let output = work(&self).await;
        self.dispose().await;
        output
    }
}

impl Drop for LeaseManager {
    fn drop(&mut self) {
        let message_id = self.inner.message.id();
        let undisposed = match self.inner.guard.try_lock() {
            Ok(guard) if guard.state.is_terminal() => return,
            Ok(_) => true,
            // Another disposition is in flight; the abandon below is skipped
            // if it settles the message.
            Err(_) => false,
        };

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(
                message_id = %message_id,
                "message lease dropped outside a runtime, lock left to expire"
            );
            return;
        };

        if undisposed {
            warn!(
                message_id = %message_id,
                "message lease dropped without disposition, abandoning"
            );
        } else {
            debug!(
                message_id = %message_id,
                "message lease dropped while a disposition is in flight"
            );
        }

        let inner = Arc::clone(&self.inner);
        runtime.spawn(async move {
            inner
                .perform(DispositionAction::Abandon, None, None)
                .await;
        });
    }
}
