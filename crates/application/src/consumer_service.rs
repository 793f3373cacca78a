use std::sync::Arc;
use std::time::Duration;

use mqlease_core::{QueueError, QueueResult};
use mqlease_domain::{
    ConsumerSettings, DispositionAction, LeaseState, LeasedMessage, ProcessingFailure,
};
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tracing::{info, warn};

use crate::cancellation::CancellationSignal;
use crate::lease_manager::LeaseManager;
use crate::lease_ports::{BrokerClient, Clock, HandlerOutcome, MessageHandler, MessageReceiver};

const DEFAULT_LOCK_DURATION: Duration = Duration::from_secs(60);
const DEFAULT_IDLE_POLL_INTERVAL: Duration = Duration::from_secs(1);

const CALLBACK_TIMEOUT_CATEGORY: &str = "CallbackTimeout";
const MAX_DELIVERY_COUNT_CATEGORY: &str = "MaxDeliveryCountExceeded";

/// Counters collected over one consumer run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumerStats {
    /// Messages received from the broker.
    pub received: u64,
    /// Messages completed.
    pub completed: u64,
    /// Messages abandoned, including expired leases.
    pub abandoned: u64,
    /// Messages dead-lettered.
    pub dead_lettered: u64,
    /// Messages whose processing task ended without a disposition.
    pub unresolved: u64,
    /// Failed receive calls.
    pub receive_failures: u64,
}

impl ConsumerStats {
    fn record(&mut self, processed: Result<LeaseState, JoinError>) {
        match processed {
            Ok(state) => match state.action() {
                Some(DispositionAction::Complete) => self.completed += 1,
                Some(DispositionAction::Abandon) => self.abandoned += 1,
                Some(DispositionAction::DeadLetter) => self.dead_lettered += 1,
                None => self.unresolved += 1,
            },
            Err(error) => {
                warn!(error = %error, "message processing task failed");
                self.unresolved += 1;
            }
        }
    }
}

/// Receive loop that leases each message and applies the handler's verdict.
pub struct ConsumerService {
    receiver: Arc<dyn MessageReceiver>,
    processor: Arc<MessageProcessor>,
    lock_duration: Duration,
    idle_poll_interval: Duration,
}

struct MessageProcessor {
    broker: Arc<dyn BrokerClient>,
    clock: Arc<dyn Clock>,
    handler: Arc<dyn MessageHandler>,
    settings: ConsumerSettings,
}

impl ConsumerService {
    /// Creates a consumer service.
    #[must_use]
    pub fn new(
        receiver: Arc<dyn MessageReceiver>,
        broker: Arc<dyn BrokerClient>,
        clock: Arc<dyn Clock>,
        handler: Arc<dyn MessageHandler>,
        settings: ConsumerSettings,
    ) -> Self {
        Self {
            receiver,
            processor: Arc::new(MessageProcessor {
                broker,
                clock,
                handler,
                settings,
            }),
            lock_duration: DEFAULT_LOCK_DURATION,
            idle_poll_interval: DEFAULT_IDLE_POLL_INTERVAL,
        }
    }

    /// Overrides the lock duration requested on receive.
    #[must_use]
    pub fn with_lock_duration(mut self, lock_duration: Duration) -> Self {
        self.lock_duration = lock_duration;
        self
    }

    /// Overrides the pause between receives when the entity is empty.
    #[must_use]
    pub fn with_idle_poll_interval(mut self, idle_poll_interval: Duration) -> Self {
        self.idle_poll_interval = idle_poll_interval;
        self
    }

    /// Receives and processes messages until `shutdown` is cancelled.
    ///
    /// In-flight messages are allowed to finish before this returns.
    pub async fn run(&self, shutdown: &CancellationSignal) -> QueueResult<ConsumerStats> {
        let settings = &self.processor.settings;
        let max_concurrent_calls = usize::try_from(settings.max_concurrent_calls())
            .unwrap_or(usize::MAX)
            .min(Semaphore::MAX_PERMITS);
        let permits = Arc::new(Semaphore::new(max_concurrent_calls));
        let mut in_flight = JoinSet::new();
        let mut stats = ConsumerStats::default();
        let mut consecutive_failures = 0_u32;

        info!(
            max_concurrent_calls,
            lock_seconds = self.lock_duration.as_secs(),
            maximum_retry_count = settings.maximum_retry_count(),
            "consumer started"
        );

        loop {
            while let Some(processed) = in_flight.try_join_next() {
                stats.record(processed);
            }

            let permit = tokio::select! {
                biased;
                () = shutdown.cancelled() => break,
                permit = Arc::clone(&permits).acquire_owned() => permit.map_err(|error| {
                    QueueError::Internal(format!("consumer concurrency limiter closed: {error}"))
                })?,
            };

            let received = tokio::select! {
                biased;
                () = shutdown.cancelled() => break,
                received = self.receiver.receive(self.lock_duration) => received,
            };

            match received {
                Ok(Some(message)) => {
                    consecutive_failures = 0;
                    stats.received += 1;
                    let processor = Arc::clone(&self.processor);
                    in_flight.spawn(async move {
                        let _permit = permit;
                        processor.process(message).await
                    });
                }
                Ok(None) => {
                    consecutive_failures = 0;
                    drop(permit);
                    pause(shutdown, self.idle_poll_interval).await;
                }
                Err(error) => {
                    drop(permit);
                    consecutive_failures = consecutive_failures.saturating_add(1);
                    stats.receive_failures += 1;
                    let backoff = settings.backoff_for(consecutive_failures);
                    warn!(
                        error = %error,
                        consecutive_failures,
                        backoff_seconds = backoff.as_secs(),
                        "failed to receive message"
                    );
                    pause(shutdown, backoff).await;
                }
            }
        }

        while let Some(processed) = in_flight.join_next().await {
            stats.record(processed);
        }

        info!(
            received = stats.received,
            completed = stats.completed,
            abandoned = stats.abandoned,
            dead_lettered = stats.dead_lettered,
            "consumer stopped"
        );

        Ok(stats)
    }

    /// Leases and processes one already-received message, returning its final state.
    pub async fn process(&self, message: LeasedMessage) -> LeaseState {
        self.processor.process(message).await
    }
}

impl MessageProcessor {
    async fn process(&self, message: LeasedMessage) -> LeaseState {
        let message = Arc::new(message);
        let work = CancellationSignal::new();
        let lease = LeaseManager::new(
            Arc::clone(&self.broker),
            Arc::clone(&self.clock),
            Arc::clone(&message),
            work.clone(),
        );
        lease.initialize().await;

        if message.delivery_count() > self.settings.maximum_retry_count() {
            warn!(
                message_id = %message.id(),
                delivery_count = message.delivery_count(),
                maximum_retry_count = self.settings.maximum_retry_count(),
                "message exceeded maximum delivery count, dead-lettering"
            );
            let failure = ProcessingFailure::new(
                MAX_DELIVERY_COUNT_CATEGORY,
                format!("delivered {} times", message.delivery_count()),
            );
            lease.dead_letter(Some(&failure)).await;
        } else if !lease.state().await.is_terminal() {
            match self.invoke_handler(&message, &work).await {
                HandlerOutcome::Complete => lease.complete().await,
                HandlerOutcome::Abandon(failure) => lease.abandon(failure.as_ref()).await,
                HandlerOutcome::DeadLetter(failure) => lease.dead_letter(Some(&failure)).await,
            };
        }

        lease.dispose().await
    }

    async fn invoke_handler(
        &self,
        message: &LeasedMessage,
        work: &CancellationSignal,
    ) -> HandlerOutcome {
        let handling = self.handler.handle(message, work.clone());
        let bounded = async {
            match self.settings.maximum_callback_timeout() {
                Some(limit) => tokio::time::timeout(limit, handling)
                    .await
                    .unwrap_or_else(|_| {
                        warn!(
                            message_id = %message.id(),
                            timeout_ms = u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
                            "message handler timed out"
                        );
                        HandlerOutcome::Abandon(Some(ProcessingFailure::new(
                            CALLBACK_TIMEOUT_CATEGORY,
                            format!("handler exceeded {}s", limit.as_secs()),
                        )))
                    }),
                None => handling.await,
            }
        };

        tokio::select! {
            outcome = bounded => outcome,
            // Lease expired; the message was already abandoned.
            () = work.cancelled() => HandlerOutcome::Abandon(None),
        }
    }
}

async fn pause(shutdown: &CancellationSignal, delay: Duration) {
    tokio::select! {
        () = shutdown.cancelled() => {}
        () = tokio::time::sleep(delay) => {}
    }
}
