use async_trait::async_trait;
use mqlease_application::{CancellationSignal, HandlerOutcome, MessageHandler};
use mqlease_domain::{LeasedMessage, ProcessingFailure};
use reqwest::StatusCode;
use tracing::warn;

const TRANSIENT_CATEGORY: &str = "HttpTransientError";
const REJECTED_CATEGORY: &str = "HttpRejectedError";
const TRANSPORT_CATEGORY: &str = "HttpTransportError";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StatusClass {
    Success,
    Transient,
    Rejected,
}

fn classify_status(status: StatusCode) -> StatusClass {
    if status.is_success() {
        StatusClass::Success
    } else if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
    {
        StatusClass::Transient
    } else {
        StatusClass::Rejected
    }
}

/// Forwards message bodies to an HTTP endpoint.
///
/// Success completes the message, throttling and server errors abandon it for
/// redelivery, and any other rejection dead-letters it.
pub struct HttpMessageHandler {
    http_client: reqwest::Client,
    endpoint: String,
}

impl HttpMessageHandler {
    /// Creates a handler posting to `endpoint`.
    #[must_use]
    pub fn new(http_client: reqwest::Client, endpoint: impl Into<String>) -> Self {
        Self {
            http_client,
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl MessageHandler for HttpMessageHandler {
    async fn handle(
        &self,
        message: &LeasedMessage,
        cancellation: CancellationSignal,
    ) -> HandlerOutcome {
        let request = self
            .http_client
            .post(self.endpoint.as_str())
            .header("X-Message-Id", message.id().as_str())
            .header("X-Delivery-Count", message.delivery_count().to_string())
            .json(message.body())
            .send();

        let response = tokio::select! {
            response = request => response,
            () = cancellation.cancelled() => return HandlerOutcome::Abandon(None),
        };

        let response = match response {
            Ok(response) => response,
            Err(error) => {
                warn!(
                    message_id = %message.id(),
                    error = %error,
                    "message handler endpoint unreachable"
                );
                return HandlerOutcome::Abandon(Some(ProcessingFailure::new(
                    TRANSPORT_CATEGORY,
                    error.to_string(),
                )));
            }
        };

        let status = response.status();
        match classify_status(status) {
            StatusClass::Success => HandlerOutcome::Complete,
            StatusClass::Transient => {
                warn!(
                    message_id = %message.id(),
                    status = status.as_u16(),
                    "message handler endpoint unavailable"
                );
                HandlerOutcome::Abandon(Some(ProcessingFailure::new(
                    TRANSIENT_CATEGORY,
                    format!("transient HTTP status {status}"),
                )))
            }
            StatusClass::Rejected => {
                let body = response
                    .text()
                    .await
                    .unwrap_or_else(|_| "<response body unavailable>".to_owned());
                warn!(
                    message_id = %message.id(),
                    status = status.as_u16(),
                    "message handler endpoint rejected message"
                );
                HandlerOutcome::DeadLetter(ProcessingFailure::new(
                    REJECTED_CATEGORY,
                    format!("HTTP status {status}: {body}"),
                ))
            }
        }
    }
}
