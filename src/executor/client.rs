//! Queue Transport
//!
//! The executor side of the polling RPC. `PollingExecutor` talks to the server
//! through the `QueueTransport` trait so the same loop runs over HTTP
//! (`HttpQueueClient`) or directly against an in-process session registry
//! (`InProcessTransport`).
//!
//! A session that the server no longer knows surfaces as a `SessionError` inside
//! the returned `anyhow::Error`, so callers can tell it apart from a transient
//! transport failure with `downcast_ref`.

use super::protocol::*;
use super::session::{ControlFlags, ExecutorSessionRegistry, SessionError, SessionId, SessionInfo};
use crate::ops::ExecutionResult;

use anyhow::Result;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

pub type TransportFuture<T> = Pin<Box<dyn Future<Output = Result<T>> + Send>>;

pub trait QueueTransport: Send + Sync {
    fn start(&self, info: SessionInfo) -> TransportFuture<ControlFlags>;

    fn stop(&self, session_id: SessionId, reason: String) -> TransportFuture<usize>;

    fn ping_alive(&self, session_id: SessionId) -> TransportFuture<ControlFlags>;

    /// Reports finished results and asks for up to `poll_count` new operations.
    fn poll_next(
        &self,
        session_id: SessionId,
        results: Vec<ExecutionResult>,
        poll_count: usize,
    ) -> TransportFuture<PollResponse>;
}

/// Calls the session registry directly; used for single-process deployments and tests.
pub struct InProcessTransport {
    sessions: Arc<ExecutorSessionRegistry>,
}

impl InProcessTransport {
    pub fn new(sessions: Arc<ExecutorSessionRegistry>) -> Arc<Self> {
        Arc::new(Self { sessions })
    }
}

impl QueueTransport for InProcessTransport {
    fn start(&self, info: SessionInfo) -> TransportFuture<ControlFlags> {
        let result = self.sessions.start(info);
        Box::pin(async move { Ok(result?) })
    }

    fn stop(&self, session_id: SessionId, reason: String) -> TransportFuture<usize> {
        let result = self.sessions.stop(&session_id, &reason);
        Box::pin(async move { Ok(result?) })
    }

    fn ping_alive(&self, session_id: SessionId) -> TransportFuture<ControlFlags> {
        let result = self.sessions.ping_alive(&session_id);
        Box::pin(async move { Ok(result?) })
    }

    fn poll_next(
        &self,
        session_id: SessionId,
        results: Vec<ExecutionResult>,
        poll_count: usize,
    ) -> TransportFuture<PollResponse> {
        let result = self
            .sessions
            .poll_next(&session_id, results, poll_count)
            .map(|outcome| PollResponse {
                ops: outcome.ops,
                control: outcome.control,
            });
        Box::pin(async move { Ok(result?) })
    }
}

/// JSON-over-HTTP client for the server's executor endpoints.
#[derive(Clone)]
pub struct HttpQueueClient {
    base_url: String,
    http_client: reqwest::Client,
    timeout: Duration,
    attempts: usize,
}

impl HttpQueueClient {
    /// `server` is `host:port` or a full `http://` URL.
    pub fn new(server: &str) -> Arc<Self> {
        let base_url = if server.starts_with("http://") || server.starts_with("https://") {
            server.trim_end_matches('/').to_string()
        } else {
            format!("http://{}", server.trim_end_matches('/'))
        };
        Arc::new(Self {
            base_url,
            http_client: reqwest::Client::new(),
            timeout: Duration::from_secs(10),
            attempts: 3,
        })
    }

    async fn post_with_retry<T: serde::Serialize>(
        http_client: &reqwest::Client,
        url: String,
        payload: &T,
        timeout: Duration,
        attempts: usize,
    ) -> Result<reqwest::Response> {
        let mut delay_ms = 150u64;

        for attempt in 0..attempts {
            let response = http_client
                .post(url.clone())
                .json(payload)
                .timeout(timeout)
                .send()
                .await;

            match response {
                Ok(resp) => return Ok(resp),
                Err(e) => {
                    if attempt + 1 == attempts {
                        return Err(anyhow::anyhow!(e));
                    }
                    // Jitter keeps restarted executors from retrying in lockstep
                    let jitter = rand::random::<u64>() % 50;
                    tokio::time::sleep(Duration::from_millis(delay_ms + jitter)).await;
                    delay_ms = (delay_ms * 2).min(1200);
                }
            }
        }

        Err(anyhow::anyhow!("Retry attempts exhausted"))
    }

    /// Posts `payload` and decodes the JSON answer, mapping error statuses.
    fn call<Req, Resp>(&self, endpoint: &str, session_id: SessionId, payload: Req) -> TransportFuture<Resp>
    where
        Req: serde::Serialize + Send + Sync + 'static,
        Resp: serde::de::DeserializeOwned + Send + 'static,
    {
        let http_client = self.http_client.clone();
        let url = format!("{}{}", self.base_url, endpoint);
        let timeout = self.timeout;
        let attempts = self.attempts;
        Box::pin(async move {
            let response = Self::post_with_retry(&http_client, url.clone(), &payload, timeout, attempts).await?;
            let status = response.status();
            if status.is_success() {
                return Ok(response.json::<Resp>().await?);
            }
            let message = response
                .json::<ErrorResponse>()
                .await
                .map(|body| body.error)
                .unwrap_or_else(|_| status.to_string());
            match status {
                reqwest::StatusCode::NOT_FOUND => Err(SessionError::UnknownSession(session_id).into()),
                reqwest::StatusCode::CONFLICT => Err(SessionError::DuplicateSession(session_id).into()),
                _ => Err(anyhow::anyhow!("{} failed: {} ({})", url, status, message)),
            }
        })
    }
}

impl QueueTransport for HttpQueueClient {
    fn start(&self, info: SessionInfo) -> TransportFuture<ControlFlags> {
        let session_id = info.session_id.clone();
        let call = self.call::<_, ControlResponse>(ENDPOINT_EXECUTOR_START, session_id, info);
        Box::pin(async move { Ok(call.await?.control) })
    }

    fn stop(&self, session_id: SessionId, reason: String) -> TransportFuture<usize> {
        let request = StopSessionRequest {
            session_id: session_id.clone(),
            reason,
        };
        let call = self.call::<_, StopSessionResponse>(ENDPOINT_EXECUTOR_STOP, session_id, request);
        Box::pin(async move { Ok(call.await?.requeued) })
    }

    fn ping_alive(&self, session_id: SessionId) -> TransportFuture<ControlFlags> {
        let request = PingAliveRequest {
            session_id: session_id.clone(),
        };
        let call = self.call::<_, ControlResponse>(ENDPOINT_EXECUTOR_PING, session_id, request);
        Box::pin(async move { Ok(call.await?.control) })
    }

    fn poll_next(
        &self,
        session_id: SessionId,
        results: Vec<ExecutionResult>,
        poll_count: usize,
    ) -> TransportFuture<PollResponse> {
        let request = PollRequest {
            session_id: session_id.clone(),
            results,
            poll_count,
        };
        self.call(ENDPOINT_EXECUTOR_POLL, session_id, request)
    }
}
