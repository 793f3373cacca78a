//! mqlease consumer worker runtime.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use mqlease_application::{CancellationSignal, Clock, ConsumerService};
use mqlease_core::{QueueError, QueueResult};
use mqlease_domain::{
    BrokerConfiguration, ConsumerSettings, DEFAULT_MAXIMUM_BACKOFF_SECONDS,
    DEFAULT_MAXIMUM_RETRY_COUNT, DEFAULT_MINIMUM_BACKOFF_SECONDS, QueueConfiguration,
    TopicConfiguration,
};
use mqlease_infrastructure::{HttpMessageHandler, RedisMessageQueue, SystemClock};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

struct WorkerConfig {
    broker: Box<dyn BrokerConfiguration>,
    key_prefix: String,
    handler_endpoint: String,
    handler_request_timeout_seconds: u64,
    lock_seconds: u64,
    idle_poll_interval_ms: u64,
}

#[tokio::main]
async fn main() -> Result<(), QueueError> {
    dotenvy::dotenv().ok();
    init_tracing();

    let config = WorkerConfig::load(|name| std::env::var(name).ok())?;
    let entity_path = config.broker.entity_path();
    let client = redis::Client::open(config.broker.connection_string())
        .map_err(|error| QueueError::Validation(format!("invalid redis url: {error}")))?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let queue = Arc::new(RedisMessageQueue::new(
        client,
        Arc::clone(&clock),
        config.key_prefix.as_str(),
        entity_path.as_str(),
    ));
    let http_client = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.handler_request_timeout_seconds))
        .build()
        .map_err(|error| QueueError::Internal(format!("failed to build HTTP client: {error}")))?;
    let handler = Arc::new(HttpMessageHandler::new(
        http_client,
        config.handler_endpoint.as_str(),
    ));

    let service = ConsumerService::new(
        queue.clone(),
        queue,
        clock,
        handler,
        config.broker.settings().clone(),
    )
    .with_lock_duration(Duration::from_secs(config.lock_seconds))
    .with_idle_poll_interval(Duration::from_millis(config.idle_poll_interval_ms));

    info!(
        entity_path = %entity_path,
        handler_endpoint = %config.handler_endpoint,
        lock_seconds = config.lock_seconds,
        "mqlease-worker started"
    );

    let shutdown = CancellationSignal::new();
    let shutdown_trigger = shutdown.clone();
    tokio::spawn(async move {
        if let Err(error) = tokio::signal::ctrl_c().await {
            warn!(error = %error, "failed to listen for shutdown signal");
            return;
        }
        info!("shutdown requested, draining in-flight messages");
        shutdown_trigger.cancel();
    });

    let stats = service.run(&shutdown).await?;
    info!(
        received = stats.received,
        completed = stats.completed,
        abandoned = stats.abandoned,
        dead_lettered = stats.dead_lettered,
        unresolved = stats.unresolved,
        receive_failures = stats.receive_failures,
        "mqlease-worker stopped"
    );

    Ok(())
}

impl WorkerConfig {
    fn load(lookup: impl Fn(&str) -> Option<String>) -> QueueResult<Self> {
        let redis_url = required_var(&lookup, "REDIS_URL")?;
        let handler_endpoint = required_var(&lookup, "HANDLER_ENDPOINT")?
            .trim_end_matches('/')
            .to_owned();
        let key_prefix = optional_var(&lookup, "QUEUE_KEY_PREFIX")
            .unwrap_or_else(|| "mqlease".to_owned());

        let max_concurrent_calls = parse_var_u32(&lookup, "QUEUE_MAX_CONCURRENT_CALLS", 1)?;
        let minimum_backoff_seconds = parse_var_u32(
            &lookup,
            "QUEUE_MIN_BACKOFF_SECONDS",
            DEFAULT_MINIMUM_BACKOFF_SECONDS,
        )?;
        let maximum_backoff_seconds = parse_var_u32(
            &lookup,
            "QUEUE_MAX_BACKOFF_SECONDS",
            DEFAULT_MAXIMUM_BACKOFF_SECONDS,
        )?;
        let maximum_retry_count = parse_var_u32(
            &lookup,
            "QUEUE_MAX_RETRY_COUNT",
            DEFAULT_MAXIMUM_RETRY_COUNT,
        )?;
        let callback_timeout_seconds = parse_var_u64(&lookup, "QUEUE_CALLBACK_TIMEOUT_SECONDS", 0)?;
        let lock_seconds = parse_var_u64(&lookup, "QUEUE_LOCK_SECONDS", 60)?;
        let idle_poll_interval_ms = parse_var_u64(&lookup, "QUEUE_IDLE_POLL_INTERVAL_MS", 1000)?;
        let handler_request_timeout_seconds =
            parse_var_u64(&lookup, "HANDLER_REQUEST_TIMEOUT_SECONDS", 30)?;

        if lock_seconds == 0 {
            return Err(QueueError::Validation(
                "QUEUE_LOCK_SECONDS must be greater than zero".to_owned(),
            ));
        }

        if idle_poll_interval_ms == 0 {
            return Err(QueueError::Validation(
                "QUEUE_IDLE_POLL_INTERVAL_MS must be greater than zero".to_owned(),
            ));
        }

        let mut settings = ConsumerSettings::new(max_concurrent_calls)?
            .with_backoff(minimum_backoff_seconds, maximum_backoff_seconds)?
            .with_maximum_retry_count(maximum_retry_count);
        if callback_timeout_seconds > 0 {
            settings = settings.with_callback_timeout(Duration::from_secs(callback_timeout_seconds));
        }

        let broker: Box<dyn BrokerConfiguration> = match (
            optional_var(&lookup, "QUEUE_NAME"),
            optional_var(&lookup, "TOPIC_NAME"),
        ) {
            (Some(queue_name), None) => {
                Box::new(QueueConfiguration::new(redis_url, queue_name, settings)?)
            }
            (None, Some(topic_name)) => Box::new(TopicConfiguration::new(
                redis_url,
                topic_name,
                required_var(&lookup, "SUBSCRIPTION_NAME")?,
                settings,
            )?),
            (Some(_), Some(_)) => {
                return Err(QueueError::Validation(
                    "set either QUEUE_NAME or TOPIC_NAME, not both".to_owned(),
                ));
            }
            (None, None) => {
                return Err(QueueError::Validation(
                    "QUEUE_NAME or TOPIC_NAME is required".to_owned(),
                ));
            }
        };

        Ok(Self {
            broker,
            key_prefix,
            handler_endpoint,
            handler_request_timeout_seconds,
            lock_seconds,
            idle_poll_interval_ms,
        })
    }
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .compact()
        .init();
}

fn optional_var(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<String> {
    lookup(name)
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}

fn required_var(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> QueueResult<String> {
    optional_var(lookup, name).ok_or_else(|| QueueError::Validation(format!("{name} is required")))
}

fn parse_var_u32(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    default: u32,
) -> QueueResult<u32> {
    match optional_var(lookup, name) {
        Some(value) => value.parse::<u32>().map_err(|error| {
            QueueError::Validation(format!("invalid {name} value '{value}': {error}"))
        }),
        None => Ok(default),
    }
}

fn parse_var_u64(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    default: u64,
) -> QueueResult<u64> {
    match optional_var(lookup, name) {
        Some(value) => value.parse::<u64>().map_err(|error| {
            QueueError::Validation(format!("invalid {name} value '{value}': {error}"))
        }),
        None => Ok(default),
    }
}
