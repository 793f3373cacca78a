use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::TimeDelta;
use mqlease_domain::{
    DispositionAction, LeaseState, LeasedMessage, ProcessingFailure, failure_properties,
    renewal_deadline,
};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::cancellation::CancellationSignal;
use crate::lease_ports::{BrokerClient, Clock};

mod scope;

/// Result of one disposition request.
///
/// Informational only: broker failures are logged and never propagated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispositionOutcome {
    /// The broker accepted the disposition.
    Applied,
    /// The broker call failed; the attempt still consumed the lease.
    BrokerFailed,
    /// Nothing was sent because the lease was already actioned or cancelled.
    Skipped,
}

/// Exclusive processing lease over one received message.
///
/// Guarantees that at most one terminal broker call (complete, abandon or
/// dead-letter) is attempted for the message, whichever of application code,
/// the expiry timer or teardown gets there first.
pub struct LeaseManager {
    inner: Arc<LeaseInner>,
    stop_signal: CancellationSignal,
}

struct LeaseInner {
    broker: Arc<dyn BrokerClient>,
    clock: Arc<dyn Clock>,
    message: Arc<LeasedMessage>,
    work_cancellation: CancellationSignal,
    guard: Mutex<LeaseGuard>,
}

struct LeaseGuard {
    state: LeaseState,
    renewal_timer: Option<JoinHandle<()>>,
}

impl LeaseGuard {
    fn can_action(&mut self, stop_signal: Option<&CancellationSignal>) -> bool {
        if stop_signal.is_some_and(CancellationSignal::is_cancelled) {
            return false;
        }

        if self.state.is_terminal() {
            return false;
        }

        if let Some(timer) = self.renewal_timer.take() {
            timer.abort();
        }

        true
    }
}

impl LeaseManager {
    /// Creates a lease over `message`.
    ///
    /// `work_cancellation` is shared with the unit of work processing the
    /// message. The manager cancels it only after abandoning an expired lease.
    /// Explicit dispositions become no-ops once it is cancelled.
    #[must_use]
    pub fn new(
        broker: Arc<dyn BrokerClient>,
        clock: Arc<dyn Clock>,
        message: Arc<LeasedMessage>,
        work_cancellation: CancellationSignal,
    ) -> Self {
        Self {
            stop_signal: work_cancellation.clone(),
            inner: Arc::new(LeaseInner {
                broker,
                clock,
                message,
                work_cancellation,
                guard: Mutex::new(LeaseGuard {
                    state: LeaseState::Active,
                    renewal_timer: None,
                }),
            }),
        }
    }

    /// Uses a separate signal to decide when explicit dispositions stop acting.
    #[must_use]
    pub fn with_stop_signal(mut self, stop_signal: CancellationSignal) -> Self {
        self.stop_signal = stop_signal;
        self
    }

    /// Starts the renewal countdown for the message lock.
    ///
    /// A lock that has already lapsed is abandoned immediately and no timer is
    /// started. Calling this more than once has no effect.
    pub async fn initialize(&self) {
        let message_id = self.inner.message.id();
        let mut guard = self.inner.guard.lock().await;
        if guard.state != LeaseState::Active {
            warn!(
                message_id = %message_id,
                state = ?guard.state,
                "message lease already initialized"
            );
            return;
        }

        let remaining = self
            .inner
            .message
            .remaining_lock(self.inner.clock.now_utc());
        let deadline = renewal_deadline(remaining);

        if deadline < TimeDelta::zero() {
            error!(
                message_id = %message_id,
                renewal_deadline_ms = deadline.num_milliseconds(),
                "invalid message lock renewal value, rejecting message"
            );
            guard.state = LeaseState::Expired;
            self.inner
                .act(
                    &mut guard,
                    DispositionAction::Abandon,
                    None,
                    Some(&self.stop_signal),
                )
                .await;
            return;
        }

        info!(
            message_id = %message_id,
            total_minutes = deadline.num_minutes(),
            "message lease granted before automatic cancellation"
        );

        guard.renewal_timer = Some(schedule_expiry(
            Arc::downgrade(&self.inner),
            deadline.to_std().unwrap_or_default(),
        ));
        guard.state = LeaseState::Renewing;
    }

    /// Acknowledges the message.
    pub async fn complete(&self) -> DispositionOutcome {
        self.inner
            .perform(DispositionAction::Complete, None, Some(&self.stop_signal))
            .await
    }

    /// Releases the message for redelivery, recording `failure` when given.
    pub async fn abandon(&self, failure: Option<&ProcessingFailure>) -> DispositionOutcome {
        self.inner
            .perform(DispositionAction::Abandon, failure, Some(&self.stop_signal))
            .await
    }

    /// Dead-letters the message, recording `failure` when given.
    pub async fn dead_letter(&self, failure: Option<&ProcessingFailure>) -> DispositionOutcome {
        self.inner
            .perform(
                DispositionAction::DeadLetter,
                failure,
                Some(&self.stop_signal),
            )
            .await
    }

    /// Releases the lease, abandoning the message unless it was already actioned.
    ///
    /// Runs regardless of any cancellation and returns the final state.
    pub async fn dispose(self) -> LeaseState {
        self.inner
            .perform(DispositionAction::Abandon, None, None)
            .await;
        self.state().await
    }

    /// Returns the current lease state.
    pub async fn state(&self) -> LeaseState {
        self.inner.guard.lock().await.state
    }

    /// Returns the leased message.
    #[must_use]
    pub fn message(&self) -> &LeasedMessage {
        &self.inner.message
    }

    /// Returns the work cancellation signal shared with the processing code.
    #[must_use]
    pub fn work_cancellation(&self) -> &CancellationSignal {
        &self.inner.work_cancellation
    }
}

impl LeaseInner {
    async fn perform(
        &self,
        action: DispositionAction,
        failure: Option<&ProcessingFailure>,
        stop_signal: Option<&CancellationSignal>,
    ) -> DispositionOutcome {
        let mut guard = match stop_signal {
            Some(signal) => tokio::select! {
                biased;
                () = signal.cancelled() => return DispositionOutcome::Skipped,
                guard = self.guard.lock() => guard,
            },
            None => self.guard.lock().await,
        };

        self.act(&mut guard, action, failure, stop_signal).await
    }

    async fn act(
        &self,
        guard: &mut LeaseGuard,
        action: DispositionAction,
        failure: Option<&ProcessingFailure>,
        stop_signal: Option<&CancellationSignal>,
    ) -> DispositionOutcome {
        if !guard.can_action(stop_signal) {
            return DispositionOutcome::Skipped;
        }

        // Recorded before the call: an attempt that was started counts even if
        // the caller stops polling mid-flight.
        guard.state = LeaseState::Actioned(action);

        let lock_token = self.message.lock_token();
        let result = match action {
            DispositionAction::Complete => self.broker.complete(lock_token).await,
            DispositionAction::Abandon => {
                self.broker
                    .abandon(
                        lock_token,
                        failure_properties(self.message.user_properties(), failure),
                    )
                    .await
            }
            DispositionAction::DeadLetter => {
                self.broker
                    .dead_letter(
                        lock_token,
                        failure_properties(self.message.user_properties(), failure),
                    )
                    .await
            }
        };

        match result {
            Ok(()) => {
                debug!(
                    message_id = %self.message.id(),
                    action = %action,
                    "message actioned"
                );
                DispositionOutcome::Applied
            }
            Err(error) => {
                error!(
                    message_id = %self.message.id(),
                    action = %action,
                    error = %error,
                    "failed to action a message"
                );
                DispositionOutcome::BrokerFailed
            }
        }
    }

    async fn expire(&self) {
        let mut guard = self.guard.lock().await;
        if guard.state.is_terminal() {
            return;
        }

        warn!(
            message_id = %self.message.id(),
            "message did not process in expected time, it will be abandoned and work cancelled"
        );

        // This task is the timer; detach its handle instead of aborting it.
        drop(guard.renewal_timer.take());
        guard.state = LeaseState::Expired;
        self.act(&mut guard, DispositionAction::Abandon, None, None)
            .await;
        drop(guard);

        self.work_cancellation.cancel();
    }
}

fn schedule_expiry(inner: Weak<LeaseInner>, after: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(after).await;
        if let Some(inner) = inner.upgrade() {
            inner.expire().await;
        }
    })
}

#[cfg(test)]
mod tests;
