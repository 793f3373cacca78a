use async_trait::async_trait;
use mqlease_domain::{LeasedMessage, ProcessingFailure};

use crate::cancellation::CancellationSignal;

/// Disposition requested by a message handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerOutcome {
    /// Processing succeeded.
    Complete,
    /// Recoverable failure; the message should be redelivered.
    Abandon(Option<ProcessingFailure>),
    /// Unrecoverable failure; the message should not be retried.
    DeadLetter(ProcessingFailure),
}

/// Application code processing one leased message.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Processes `message`, stopping early once `cancellation` fires.
    async fn handle(
        &self,
        message: &LeasedMessage,
        cancellation: CancellationSignal,
    ) -> HandlerOutcome;
}
