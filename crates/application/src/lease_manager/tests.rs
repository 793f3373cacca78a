use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, TimeZone, Utc};
use serde_json::json;
use tokio::sync::Mutex;

use mqlease_core::{QueueError, QueueResult};
use mqlease_domain::{
    DispositionAction, EXCEPTIONS_PROPERTY, LeaseState, LeasedMessage, LockToken, MessageId,
    MessageProperties, ProcessingFailure,
};

use crate::cancellation::CancellationSignal;
use crate::lease_ports::{BrokerClient, Clock};

use super::{DispositionOutcome, LeaseManager};

#[derive(Debug, Clone)]
struct BrokerCall {
    action: DispositionAction,
    lock_token: LockToken,
    properties: MessageProperties,
    work_cancelled_during_call: bool,
}

#[derive(Default)]
struct FakeBrokerClient {
    calls: Mutex<Vec<BrokerCall>>,
    fail: bool,
    delay: Option<Duration>,
    observed_work: Option<CancellationSignal>,
}

impl FakeBrokerClient {
    fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    fn slow(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    fn observing(work: CancellationSignal) -> Self {
        Self {
            observed_work: Some(work),
            ..Self::default()
        }
    }

    async fn record(
        &self,
        action: DispositionAction,
        lock_token: &LockToken,
        properties: MessageProperties,
    ) -> QueueResult<()> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        self.calls.lock().await.push(BrokerCall {
            action,
            lock_token: lock_token.clone(),
            properties,
            work_cancelled_during_call: self
                .observed_work
                .as_ref()
                .is_some_and(CancellationSignal::is_cancelled),
        });

        if self.fail {
            return Err(QueueError::Broker("simulated broker outage".to_owned()));
        }

        Ok(())
    }

    async fn calls(&self) -> Vec<BrokerCall> {
        self.calls.lock().await.clone()
    }
}

#[async_trait]
impl BrokerClient for FakeBrokerClient {
    async fn complete(&self, lock_token: &LockToken) -> QueueResult<()> {
        self.record(
            DispositionAction::Complete,
            lock_token,
            MessageProperties::new(),
        )
        .await
    }

    async fn abandon(
        &self,
        lock_token: &LockToken,
        properties: MessageProperties,
    ) -> QueueResult<()> {
        self.record(DispositionAction::Abandon, lock_token, properties)
            .await
    }

    async fn dead_letter(
        &self,
        lock_token: &LockToken,
        properties: MessageProperties,
    ) -> QueueResult<()> {
        self.record(DispositionAction::DeadLetter, lock_token, properties)
            .await
    }
}

struct FixedClock(DateTime<Utc>);

impl Clock for FixedClock {
    fn now_utc(&self) -> DateTime<Utc> {
        self.0
    }
}

fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0)
        .single()
        .unwrap_or_else(|| unreachable!())
}

fn message(lock_remaining: TimeDelta, user_properties: MessageProperties) -> Arc<LeasedMessage> {
    let id = MessageId::new("message-1").unwrap_or_else(|_| unreachable!());
    let lock_token = LockToken::new("lock-1").unwrap_or_else(|_| unreachable!());
    Arc::new(
        LeasedMessage::new(id, lock_token, now() + lock_remaining)
            .with_user_properties(user_properties),
    )
}

fn build_manager(
    broker: Arc<FakeBrokerClient>,
    lock_remaining: TimeDelta,
    work: CancellationSignal,
) -> LeaseManager {
    LeaseManager::new(
        broker,
        Arc::new(FixedClock(now())),
        message(lock_remaining, MessageProperties::new()),
        work,
    )
}

async fn wait_for_calls(broker: &FakeBrokerClient, expected: usize) -> Vec<BrokerCall> {
    for _ in 0..100 {
        let calls = broker.calls().await;
        if calls.len() >= expected {
            return calls;
        }
        tokio::task::yield_now().await;
    }
    broker.calls().await
}

#[tokio::test]
async fn complete_then_abandon_only_completes() {
    let broker = Arc::new(FakeBrokerClient::default());
    let manager = build_manager(
        broker.clone(),
        TimeDelta::minutes(10),
        CancellationSignal::new(),
    );
    manager.initialize().await;

    assert_eq!(manager.complete().await, DispositionOutcome::Applied);
    assert_eq!(manager.abandon(None).await, DispositionOutcome::Skipped);

    let calls = broker.calls().await;
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].action, DispositionAction::Complete);
    assert_eq!(calls[0].lock_token.as_str(), "lock-1");
    assert!(calls[0].properties.is_empty());
    assert_eq!(
        manager.state().await,
        LeaseState::Actioned(DispositionAction::Complete)
    );
}

#[tokio::test(start_paused = true)]
async fn lapsed_lock_is_abandoned_without_timer() {
    let broker = Arc::new(FakeBrokerClient::default());
    let work = CancellationSignal::new();
    let manager = build_manager(broker.clone(), TimeDelta::seconds(-30), work.clone());

    manager.initialize().await;

    let calls = broker.calls().await;
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].action, DispositionAction::Abandon);
    assert!(calls[0].properties.is_empty());
    assert_eq!(
        manager.state().await,
        LeaseState::Actioned(DispositionAction::Abandon)
    );

    tokio::time::sleep(Duration::from_secs(3_600)).await;
    assert_eq!(broker.calls().await.len(), 1);
    assert!(!work.is_cancelled());
}

#[tokio::test(start_paused = true)]
async fn lock_lapsed_by_nanoseconds_is_abandoned_without_timer() {
    let broker = Arc::new(FakeBrokerClient::default());
    let work = CancellationSignal::new();
    let manager = build_manager(broker.clone(), TimeDelta::nanoseconds(-50), work.clone());

    manager.initialize().await;
    assert_eq!(
        manager.state().await,
        LeaseState::Actioned(DispositionAction::Abandon)
    );

    tokio::time::sleep(Duration::from_millis(1)).await;
    let calls = broker.calls().await;
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].action, DispositionAction::Abandon);
    assert!(!work.is_cancelled());
}

#[tokio::test(start_paused = true)]
async fn ten_minute_lock_expires_after_nine_minutes() {
    let broker = Arc::new(FakeBrokerClient::default());
    let work = CancellationSignal::new();
    let manager = build_manager(broker.clone(), TimeDelta::minutes(10), work.clone());
    manager.initialize().await;
    assert_eq!(manager.state().await, LeaseState::Renewing);

    tokio::time::sleep(Duration::from_secs(9 * 60) - Duration::from_millis(1)).await;
    assert!(broker.calls().await.is_empty());
    assert!(!work.is_cancelled());

    tokio::time::sleep(Duration::from_millis(2)).await;
    work.cancelled().await;

    let calls = broker.calls().await;
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].action, DispositionAction::Abandon);
}

#[tokio::test(start_paused = true)]
async fn expiry_abandons_before_cancelling_work() {
    let work = CancellationSignal::new();
    let broker = Arc::new(FakeBrokerClient::observing(work.clone()));
    let manager = build_manager(broker.clone(), TimeDelta::minutes(5), work.clone());
    manager.initialize().await;

    work.cancelled().await;

    let calls = broker.calls().await;
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].action, DispositionAction::Abandon);
    assert!(!calls[0].work_cancelled_during_call);
    assert_eq!(
        manager.state().await,
        LeaseState::Actioned(DispositionAction::Abandon)
    );

    assert_eq!(manager.complete().await, DispositionOutcome::Skipped);
    assert_eq!(broker.calls().await.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn explicit_disposition_stops_renewal_timer() {
    let broker = Arc::new(FakeBrokerClient::default());
    let work = CancellationSignal::new();
    let manager = build_manager(broker.clone(), TimeDelta::minutes(1), work.clone());
    manager.initialize().await;

    assert_eq!(
        manager
            .dead_letter(Some(&ProcessingFailure::new("PoisonError", "bad payload")))
            .await,
        DispositionOutcome::Applied
    );

    tokio::time::sleep(Duration::from_secs(600)).await;
    assert_eq!(broker.calls().await.len(), 1);
    assert!(!work.is_cancelled());
}

#[tokio::test(start_paused = true)]
async fn racing_abandon_and_dead_letter_reach_broker_once() {
    let broker = Arc::new(FakeBrokerClient::slow(Duration::from_millis(50)));
    let manager = build_manager(
        broker.clone(),
        TimeDelta::minutes(10),
        CancellationSignal::new(),
    );
    manager.initialize().await;

    let failure = ProcessingFailure::new("IoError", "disk full");
    let (abandoned, dead_lettered) = tokio::join!(
        manager.abandon(Some(&failure)),
        manager.dead_letter(Some(&failure))
    );

    let outcomes = [abandoned, dead_lettered];
    assert_eq!(
        outcomes
            .iter()
            .filter(|outcome| **outcome == DispositionOutcome::Applied)
            .count(),
        1
    );
    assert!(outcomes.contains(&DispositionOutcome::Skipped));
    assert_eq!(broker.calls().await.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_callers_produce_exactly_one_broker_call() {
    let broker = Arc::new(FakeBrokerClient::slow(Duration::from_millis(5)));
    let manager = Arc::new(build_manager(
        broker.clone(),
        TimeDelta::minutes(10),
        CancellationSignal::new(),
    ));
    manager.initialize().await;

    let mut tasks = Vec::new();
    for index in 0..12 {
        let manager = manager.clone();
        tasks.push(tokio::spawn(async move {
            match index % 3 {
                0 => manager.complete().await,
                1 => manager.abandon(None).await,
                _ => manager.dead_letter(None).await,
            }
        }));
    }

    let mut applied = 0;
    for task in tasks {
        let outcome = task.await.unwrap_or(DispositionOutcome::Skipped);
        if outcome == DispositionOutcome::Applied {
            applied += 1;
        }
    }

    assert_eq!(applied, 1);
    assert_eq!(broker.calls().await.len(), 1);
}

#[tokio::test]
async fn cancelled_work_turns_explicit_dispositions_into_no_ops() {
    let broker = Arc::new(FakeBrokerClient::default());
    let work = CancellationSignal::new();
    let manager = build_manager(broker.clone(), TimeDelta::minutes(10), work.clone());
    manager.initialize().await;

    work.cancel();

    assert_eq!(manager.complete().await, DispositionOutcome::Skipped);
    assert_eq!(manager.abandon(None).await, DispositionOutcome::Skipped);
    assert!(broker.calls().await.is_empty());
    assert_eq!(manager.state().await, LeaseState::Renewing);
}

#[tokio::test]
async fn dispose_abandons_even_after_work_was_cancelled() {
    let broker = Arc::new(FakeBrokerClient::default());
    let work = CancellationSignal::new();
    let manager = build_manager(broker.clone(), TimeDelta::minutes(10), work.clone());
    manager.initialize().await;
    work.cancel();

    let state = manager.dispose().await;

    assert_eq!(state, LeaseState::Actioned(DispositionAction::Abandon));
    let calls = wait_for_calls(&broker, 2).await;
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].action, DispositionAction::Abandon);
}

#[tokio::test]
async fn dispose_after_completion_is_a_no_op() {
    let broker = Arc::new(FakeBrokerClient::default());
    let manager = build_manager(
        broker.clone(),
        TimeDelta::minutes(10),
        CancellationSignal::new(),
    );
    manager.initialize().await;
    manager.complete().await;

    let state = manager.dispose().await;

    assert_eq!(state, LeaseState::Actioned(DispositionAction::Complete));
    let calls = wait_for_calls(&broker, 2).await;
    assert_eq!(calls.len(), 1);
}

#[tokio::test]
async fn dropping_undisposed_lease_abandons_message() {
    let broker = Arc::new(FakeBrokerClient::default());
    let manager = build_manager(
        broker.clone(),
        TimeDelta::minutes(10),
        CancellationSignal::new(),
    );
    manager.initialize().await;

    drop(manager);

    let calls = wait_for_calls(&broker, 1).await;
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].action, DispositionAction::Abandon);
}

#[tokio::test(start_paused = true)]
async fn dropping_lease_during_expiry_abandons_once() {
    let broker = Arc::new(FakeBrokerClient::slow(Duration::from_secs(5)));
    let work = CancellationSignal::new();
    let manager = build_manager(broker.clone(), TimeDelta::seconds(10), work.clone());
    manager.initialize().await;

    // Expiry fires at 9s and holds the lease for the slow abandon.
    tokio::time::sleep(Duration::from_secs(9) + Duration::from_millis(1)).await;
    drop(manager);

    tokio::time::sleep(Duration::from_secs(30)).await;
    let calls = broker.calls().await;
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].action, DispositionAction::Abandon);
    assert!(work.is_cancelled());
}

#[tokio::test]
async fn broker_failure_is_swallowed_and_consumes_the_lease() {
    let broker = Arc::new(FakeBrokerClient::failing());
    let manager = build_manager(
        broker.clone(),
        TimeDelta::minutes(10),
        CancellationSignal::new(),
    );
    manager.initialize().await;

    assert_eq!(manager.complete().await, DispositionOutcome::BrokerFailed);
    assert_eq!(
        manager.state().await,
        LeaseState::Actioned(DispositionAction::Complete)
    );
    assert_eq!(manager.abandon(None).await, DispositionOutcome::Skipped);
    assert_eq!(broker.calls().await.len(), 1);
}

#[tokio::test]
async fn abandon_appends_failure_to_existing_exceptions_chain() {
    let broker = Arc::new(FakeBrokerClient::default());
    let manager = LeaseManager::new(
        broker.clone(),
        Arc::new(FixedClock(now())),
        message(
            TimeDelta::minutes(10),
            MessageProperties::from([(EXCEPTIONS_PROPERTY.to_owned(), json!("TimeoutError"))]),
        ),
        CancellationSignal::new(),
    );
    manager.initialize().await;

    manager
        .abandon(Some(&ProcessingFailure::new("HttpError", "503")))
        .await;

    let calls = broker.calls().await;
    assert_eq!(calls.len(), 1);
    assert_eq!(
        calls[0].properties.get(EXCEPTIONS_PROPERTY),
        Some(&json!("TimeoutError:HttpError"))
    );
}

#[tokio::test]
async fn separate_stop_signal_governs_explicit_dispositions() {
    let broker = Arc::new(FakeBrokerClient::default());
    let work = CancellationSignal::new();
    let stop = CancellationSignal::new();
    let manager = build_manager(broker.clone(), TimeDelta::minutes(10), work.clone())
        .with_stop_signal(stop.clone());
    manager.initialize().await;

    work.cancel();
    assert_eq!(manager.complete().await, DispositionOutcome::Applied);
    assert_eq!(broker.calls().await.len(), 1);
}

#[tokio::test]
async fn cancelled_stop_signal_skips_while_work_continues() {
    let broker = Arc::new(FakeBrokerClient::default());
    let stop = CancellationSignal::new();
    let manager = build_manager(
        broker.clone(),
        TimeDelta::minutes(10),
        CancellationSignal::new(),
    )
    .with_stop_signal(stop.clone());
    manager.initialize().await;

    stop.cancel();

    assert_eq!(manager.dead_letter(None).await, DispositionOutcome::Skipped);
    assert!(broker.calls().await.is_empty());
}

#[tokio::test]
async fn second_initialize_does_not_reschedule() {
    let broker = Arc::new(FakeBrokerClient::default());
    let manager = build_manager(
        broker.clone(),
        TimeDelta::seconds(-1),
        CancellationSignal::new(),
    );

    manager.initialize().await;
    manager.initialize().await;

    assert_eq!(broker.calls().await.len(), 1);
}

#[tokio::test]
async fn scoped_work_without_disposition_is_abandoned() {
    let broker = Arc::new(FakeBrokerClient::default());
    let manager = build_manager(
        broker.clone(),
        TimeDelta::minutes(10),
        CancellationSignal::new(),
    );
    manager.initialize().await;

    let answer = manager.scoped(async |_lease| 42).await;

    assert_eq!(answer, 42);
    let calls = wait_for_calls(&broker, 2).await;
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].action, DispositionAction::Abandon);
}

#[tokio::test]
async fn scoped_work_that_completes_is_not_abandoned() {
    let broker = Arc::new(FakeBrokerClient::default());
    let manager = build_manager(
        broker.clone(),
        TimeDelta::minutes(10),
        CancellationSignal::new(),
    );
    manager.initialize().await;

    let outcome = manager.scoped(async |lease| lease.complete().await).await;

    assert_eq!(outcome, DispositionOutcome::Applied);
    let calls = wait_for_calls(&broker, 2).await;
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].action, DispositionAction::Complete);
}
