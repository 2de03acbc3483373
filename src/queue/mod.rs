//! Request Queue.
//!
//! A single-worker FIFO in front of the Control Center: callers
//! `submit()` a request and await a `QueueOutcome` on a one-shot
//! channel. Requests are delivered strictly in submission order because
//! the worker drains an `mpsc` channel (itself FIFO) one item at a
//! time, never starting request `n + 1` before `n` has either
//! succeeded, failed permanently, or exhausted its retry sleep.
//!
//! The Java source this is drawn from hands the listener a live,
//! not-yet-closed `InputStream` and warns the listener not to close it.
//! `reqwest::Response::text()` already buffers the whole body before
//! returning, so that ownership hazard does not exist here — the
//! listener simply receives the collected body as a `String`.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

use crate::backoff::BackoffSchedule;
use crate::config::AgentConfig;
use crate::errors::PermanentRequestFailure;

/// The two concrete request shapes the coordinator protocol supports.
#[derive(Debug, Clone)]
pub enum RequestBody {
    /// `application/x-www-form-urlencoded`; repeated keys preserved —
    /// built by the caller with `urlencoding`, never a map-based encoder.
    Form(String),
    /// `text/xml`.
    Xml(String),
}

impl RequestBody {
    fn content_type(&self) -> &'static str {
        match self {
            RequestBody::Form(_) => "application/x-www-form-urlencoded",
            RequestBody::Xml(_) => "text/xml",
        }
    }

    fn as_bytes(&self) -> &[u8] {
        match self {
            RequestBody::Form(s) => s.as_bytes(),
            RequestBody::Xml(s) => s.as_bytes(),
        }
    }
}

/// One outgoing request: a page relative to `serverBaseURL`, an
/// optional ordered query string, and an optional body.
#[derive(Debug, Clone)]
pub struct OutgoingRequest {
    pub page: String,
    /// Already percent-encoded `name=value&...` — built the same way as
    /// a form body, never through a map (duplicates preserved).
    pub query: Option<String>,
    pub body: Option<RequestBody>,
}

impl OutgoingRequest {
    pub fn new(page: impl Into<String>) -> Self {
        Self {
            page: page.into(),
            query: None,
            body: None,
        }
    }

    pub fn with_query(mut self, query: String) -> Self {
        self.query = Some(query);
        self
    }

    pub fn with_body(mut self, body: RequestBody) -> Self {
        self.body = Some(body);
        self
    }
}

/// What the queue hands back to a submitter: exactly one of these per
/// submission.
#[derive(Debug)]
pub enum QueueOutcome {
    Replied(String),
    Failed(PermanentRequestFailure),
}

enum RetryAction {
    Success,
    Permanent,
    Transient,
}

fn classify(status: reqwest::StatusCode) -> RetryAction {
    use reqwest::StatusCode as S;
    if status.as_u16() < 400 {
        return RetryAction::Success;
    }
    match status {
        S::INTERNAL_SERVER_ERROR
        | S::BAD_REQUEST
        | S::UNAUTHORIZED
        | S::PROXY_AUTHENTICATION_REQUIRED
        | S::FORBIDDEN
        | S::LENGTH_REQUIRED => RetryAction::Permanent,
        _ => RetryAction::Transient,
    }
}

struct Submission {
    request: OutgoingRequest,
    reply: oneshot::Sender<QueueOutcome>,
}

/// Handle used by other components to enqueue requests. Cloning is
/// cheap; the worker task keeps running as long as at least one handle
/// (or a queued submission) is alive. Draining the outgoing queue
/// before the process terminates falls out for free:
/// once every handle is dropped the channel closes, the worker finishes
/// whatever is still queued, and its `JoinHandle` resolves.
#[derive(Clone)]
pub struct RequestQueueHandle {
    sender: mpsc::UnboundedSender<Submission>,
}

impl RequestQueueHandle {
    /// Enqueues `request` and returns a receiver that resolves to
    /// exactly one `QueueOutcome` once the queue has processed it.
    pub fn submit(&self, request: OutgoingRequest) -> oneshot::Receiver<QueueOutcome> {
        let (reply, rx) = oneshot::channel();
        // The channel only closes when every handle (including the
        // worker's own retained sender-less state) is gone; a send
        // error here means the worker has already shut down, which
        // only happens after every handle was dropped — including
        // this one, contradicting `&self`. Kept as a log, not a panic,
        // because shutdown races are still possible during drain.
        if self
            .sender
            .send(Submission { request, reply })
            .is_err()
        {
            warn!("request queue worker is gone; dropping submission");
        }
        rx
    }
}

/// Spawns the queue worker and returns a handle plus its `JoinHandle`.
/// The caller awaits the `JoinHandle` after dropping every
/// `RequestQueueHandle` clone to observe queue drain on shutdown.
pub fn spawn(
    client: reqwest::Client,
    config: Arc<AgentConfig>,
) -> (RequestQueueHandle, tokio::task::JoinHandle<()>) {
    let (sender, receiver) = mpsc::unbounded_channel();
    let handle = RequestQueueHandle { sender };
    let worker = tokio::spawn(worker_loop(client, config, receiver));
    (handle, worker)
}

async fn worker_loop(
    client: reqwest::Client,
    config: Arc<AgentConfig>,
    mut receiver: mpsc::UnboundedReceiver<Submission>,
) {
    let retry_schedule = BackoffSchedule::queue_retry();
    let auth_header = config.control_center.basic_auth_header();
    let base_url = &config.control_center.server_base_url;

    while let Some(Submission { request, reply }) = receiver.recv().await {
        let mut url = format!("{base_url}{}", request.page);
        if let Some(query) = &request.query {
            url.push('?');
            url.push_str(query);
        }

        let mut attempt = 1u32;
        loop {
            let mut builder = client
                .post(&url)
                .header("Authorization", auth_header.clone());
            if let Some(body) = &request.body {
                builder = builder
                    .header("Content-Type", body.content_type())
                    .body(body.as_bytes().to_vec());
            }

            match builder.send().await {
                Ok(response) => {
                    let status = response.status();
                    match classify(status) {
                        RetryAction::Success => {
                            let text = response.text().await.unwrap_or_default();
                            let _ = reply.send(QueueOutcome::Replied(text));
                            break;
                        }
                        RetryAction::Permanent => {
                            let _ = reply.send(QueueOutcome::Failed(PermanentRequestFailure {
                                status: status.as_u16(),
                                page: request.page.clone(),
                            }));
                            break;
                        }
                        RetryAction::Transient => {
                            warn!(status = %status, page = %request.page, attempt, "transient HTTP status, retrying");
                            tokio::time::sleep(retry_schedule.delay_for_attempt(attempt)).await;
                            attempt += 1;
                        }
                    }
                }
                Err(err) => {
                    warn!(error = %err, page = %request.page, attempt, "transport error, retrying");
                    tokio::time::sleep(retry_schedule.delay_for_attempt(attempt)).await;
                    attempt += 1;
                }
            }
        }
    }

    info!("request queue drained, worker exiting");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_5xx_as_permanent() {
        assert!(matches!(
            classify(reqwest::StatusCode::INTERNAL_SERVER_ERROR),
            RetryAction::Permanent
        ));
    }

    #[test]
    fn classifies_other_5xx_as_transient() {
        for status in [
            reqwest::StatusCode::BAD_GATEWAY,
            reqwest::StatusCode::SERVICE_UNAVAILABLE,
            reqwest::StatusCode::GATEWAY_TIMEOUT,
        ] {
            assert!(matches!(classify(status), RetryAction::Transient));
        }
    }

    #[test]
    fn classifies_400_401_403_407_411_as_permanent() {
        for status in [
            reqwest::StatusCode::BAD_REQUEST,
            reqwest::StatusCode::UNAUTHORIZED,
            reqwest::StatusCode::FORBIDDEN,
            reqwest::StatusCode::PROXY_AUTHENTICATION_REQUIRED,
            reqwest::StatusCode::LENGTH_REQUIRED,
        ] {
            assert!(matches!(classify(status), RetryAction::Permanent));
        }
    }

    #[test]
    fn classifies_other_4xx_as_transient() {
        assert!(matches!(
            classify(reqwest::StatusCode::CONFLICT),
            RetryAction::Transient
        ));
    }

    #[test]
    fn classifies_below_400_as_success() {
        assert!(matches!(
            classify(reqwest::StatusCode::OK),
            RetryAction::Success
        ));
        assert!(matches!(
            classify(reqwest::StatusCode::FOUND),
            RetryAction::Success
        ));
    }
}
