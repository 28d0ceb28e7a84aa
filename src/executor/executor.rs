//! Polling Executor
//!
//! The executor process side of a session. It pulls operations from the server
//! through a `QueueTransport`, runs them on a local worker pool, and reports
//! results back on the next poll.
//!
//! ## Responsibilities
//! - **Flow control**: keeps `thread_count + poll_ahead` operations in flight and
//!   asks for exactly the missing count on each cycle.
//! - **Batching of reports**: finished results are buffered and piggybacked on
//!   the next poll. After a transport failure the buffer is kept and re-sent.
//! - **Liveness**: when there is nothing to report or poll, sleeps until the
//!   next ping-alive deadline (or the idle poll delay) instead of spinning.
//! - **Control**: reacts to changes of the server's control flags. Suspend stops
//!   polling, stop drains in-flight work then ends the session, kill flushes once
//!   and exits without telling the server.

use super::client::QueueTransport;
use super::runner::execute_blocking;
use super::session::{ControlFlags, SessionError, SessionId, SessionInfo};
use crate::config::ExecutorConfig;
use crate::ops::{ExecutionContext, ExecutionResult, Operation, now_ms};

use anyhow::Result;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Semaphore, mpsc};
use tokio_util::sync::CancellationToken;

/// Consecutive transport failures tolerated while draining before giving up.
const MAX_DRAIN_FAILURES: usize = 3;

/// Why `PollingExecutor::run` returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// The server asked for a graceful stop; the session was closed.
    Stopped,
    /// The local cancellation token fired; the session was closed.
    Cancelled,
    /// The server asked for a kill; the session was left for the liveness check.
    Killed,
    /// The server no longer knows the session.
    SessionLost,
}

pub struct PollingExecutor {
    transport: Arc<dyn QueueTransport>,
    ctx: ExecutionContext,
    config: ExecutorConfig,
    info: SessionInfo,
}

/// Mutable loop state, kept apart from the executor so `run` can borrow both.
struct LoopState {
    control: ControlFlags,
    in_flight: usize,
    pending: Vec<ExecutionResult>,
    last_contact: Instant,
    idle_until: Option<Instant>,
    draining: Option<ExitReason>,
    drain_failures: usize,
}

impl PollingExecutor {
    pub fn new(
        transport: Arc<dyn QueueTransport>,
        ctx: ExecutionContext,
        config: ExecutorConfig,
        host: impl Into<String>,
    ) -> Self {
        Self::with_props(transport, ctx, config, host, BTreeMap::new())
    }

    pub fn with_props(
        transport: Arc<dyn QueueTransport>,
        ctx: ExecutionContext,
        config: ExecutorConfig,
        host: impl Into<String>,
        props: BTreeMap<String, String>,
    ) -> Self {
        Self {
            transport,
            ctx,
            config,
            info: SessionInfo {
                session_id: SessionId::generate(),
                host: host.into(),
                start_time: now_ms(),
                props,
            },
        }
    }

    pub fn session_id(&self) -> &SessionId {
        &self.info.session_id
    }

    fn target_in_flight(&self) -> usize {
        self.config.thread_count.max(1) + self.config.poll_ahead
    }

    /// Starts the session and runs until stopped, killed, cancelled, or the
    /// server forgets the session.
    pub async fn run(&self, cancel: CancellationToken) -> Result<ExitReason> {
        let session_id = self.info.session_id.clone();
        let initial = self.transport.start(self.info.clone()).await?;
        tracing::info!(
            "Executor session {} started ({} threads, {} poll-ahead)",
            session_id,
            self.config.thread_count,
            self.config.poll_ahead
        );

        let (result_tx, mut result_rx) = mpsc::unbounded_channel::<ExecutionResult>();
        let workers = Arc::new(Semaphore::new(self.config.thread_count.max(1)));
        let mut state = LoopState {
            control: ControlFlags::default(),
            in_flight: 0,
            pending: Vec::new(),
            last_contact: Instant::now(),
            idle_until: None,
            draining: None,
            drain_failures: 0,
        };
        if let Some(reason) = self.apply_control(&mut state, initial) {
            return Ok(self.exit_now(reason, &mut state, &mut result_rx).await);
        }

        loop {
            while let Ok(result) = result_rx.try_recv() {
                state.in_flight -= 1;
                state.pending.push(result);
            }
            if state.draining.is_none() && cancel.is_cancelled() {
                tracing::info!("Executor session {}: cancelled, draining {} in-flight operations", session_id, state.in_flight);
                state.draining = Some(ExitReason::Cancelled);
            }

            let now = Instant::now();
            if let Some(reason) = state.draining
                && state.in_flight == 0
                && state.pending.is_empty()
            {
                match self.transport.stop(session_id.clone(), format!("{:?}", reason)).await {
                    Ok(requeued) if requeued > 0 => {
                        tracing::warn!("Executor session {} stopped, server re-queued {} operations", session_id, requeued)
                    }
                    Ok(_) => tracing::info!("Executor session {} stopped", session_id),
                    Err(e) => tracing::warn!("Executor session {}: stop call failed: {:#}", session_id, e),
                }
                return Ok(reason);
            }

            let poll_allowed = state.draining.is_none()
                && !state.control.blocks_polling()
                && state.idle_until.is_none_or(|until| now >= until);
            let poll_count = if poll_allowed {
                self.target_in_flight().saturating_sub(state.in_flight)
            } else {
                0
            };
            let ping_due = now.saturating_duration_since(state.last_contact) >= self.config.ping_alive_interval;

            if !state.pending.is_empty() || poll_count > 0 {
                let sent = state.pending.len();
                let outcome = self
                    .transport
                    .poll_next(session_id.clone(), state.pending.clone(), poll_count)
                    .await;
                match outcome {
                    Ok(response) => {
                        state.pending.drain(..sent);
                        state.last_contact = Instant::now();
                        state.drain_failures = 0;
                        let received = response.ops.len();
                        state.idle_until = (poll_count > 0 && received < poll_count)
                            .then(|| Instant::now() + self.config.idle_poll_interval);
                        tracing::debug!(
                            "Session {}: reported {}, asked {}, received {}",
                            session_id,
                            sent,
                            poll_count,
                            received
                        );
                        for op in response.ops {
                            state.in_flight += 1;
                            self.spawn_op(op, &workers, &result_tx);
                        }
                        if let Some(reason) = self.apply_control(&mut state, response.control) {
                            return Ok(self.exit_now(reason, &mut state, &mut result_rx).await);
                        }
                        continue;
                    }
                    Err(e) => {
                        if let Some(reason) = self.on_transport_error(&mut state, e)? {
                            return Ok(reason);
                        }
                        tokio::select! {
                            _ = tokio::time::sleep(self.config.transport_retry_delay) => {}
                            _ = cancel.cancelled(), if state.draining.is_none() => {}
                        }
                        continue;
                    }
                }
            }

            if ping_due {
                match self.transport.ping_alive(session_id.clone()).await {
                    Ok(control) => {
                        state.last_contact = Instant::now();
                        state.drain_failures = 0;
                        if let Some(reason) = self.apply_control(&mut state, control) {
                            return Ok(self.exit_now(reason, &mut state, &mut result_rx).await);
                        }
                    }
                    Err(e) => {
                        if let Some(reason) = self.on_transport_error(&mut state, e)? {
                            return Ok(reason);
                        }
                        state.last_contact = Instant::now();
                    }
                }
                continue;
            }

            let mut wake_at = state.last_contact + self.config.ping_alive_interval;
            if let Some(until) = state.idle_until
                && state.draining.is_none()
                && !state.control.blocks_polling()
            {
                wake_at = wake_at.min(until);
            }
            tokio::select! {
                Some(result) = result_rx.recv() => {
                    state.in_flight -= 1;
                    state.pending.push(result);
                }
                _ = tokio::time::sleep_until(wake_at.into()) => {}
                _ = cancel.cancelled(), if state.draining.is_none() => {}
            }
        }
    }

    /// Leaves without closing the session. On kill, results finished so far get
    /// one best-effort report.
    async fn exit_now(
        &self,
        reason: ExitReason,
        state: &mut LoopState,
        result_rx: &mut mpsc::UnboundedReceiver<ExecutionResult>,
    ) -> ExitReason {
        if reason != ExitReason::Killed {
            return reason;
        }
        while let Ok(result) = result_rx.try_recv() {
            state.in_flight -= 1;
            state.pending.push(result);
        }
        if !state.pending.is_empty() {
            let results = std::mem::take(&mut state.pending);
            let count = results.len();
            match self.transport.poll_next(self.info.session_id.clone(), results, 0).await {
                Ok(_) => tracing::info!("Executor session {}: flushed {} results before exit", self.info.session_id, count),
                Err(e) => tracing::warn!("Executor session {}: lost {} results on kill: {:#}", self.info.session_id, count, e),
            }
        }
        reason
    }

    /// Applies a new set of control flags, acting only on changed values.
    /// Returns an exit reason when the loop must end right away.
    fn apply_control(&self, state: &mut LoopState, control: ControlFlags) -> Option<ExitReason> {
        let previous = state.control;
        state.control = control;
        let session_id = &self.info.session_id;

        if control.polling_suspend_requested != previous.polling_suspend_requested {
            tracing::info!(
                "Executor session {}: polling {}",
                session_id,
                if control.polling_suspend_requested { "suspended" } else { "resumed" }
            );
            state.idle_until = None;
        }
        if control.stop_requested && !previous.stop_requested && state.draining.is_none() {
            tracing::info!(
                "Executor session {}: stop requested, draining {} in-flight operations",
                session_id,
                state.in_flight
            );
            state.draining = Some(ExitReason::Stopped);
        }
        if control.kill_requested && !previous.kill_requested {
            tracing::warn!(
                "Executor session {}: kill requested, abandoning {} in-flight operations",
                session_id,
                state.in_flight
            );
            return Some(ExitReason::Killed);
        }
        None
    }

    /// Classifies a failed call. An unknown session ends the loop; anything else
    /// is transient unless the drain has failed too often.
    fn on_transport_error(&self, state: &mut LoopState, error: anyhow::Error) -> Result<Option<ExitReason>> {
        if let Some(SessionError::UnknownSession(_)) = error.downcast_ref::<SessionError>() {
            tracing::error!(
                "Executor session {} is unknown to the server, dropping {} buffered results",
                self.info.session_id,
                state.pending.len()
            );
            return Ok(Some(ExitReason::SessionLost));
        }
        tracing::warn!(
            "Executor session {}: transport failure, keeping {} buffered results: {:#}",
            self.info.session_id,
            state.pending.len(),
            error
        );
        if state.draining.is_some() {
            state.drain_failures += 1;
            if state.drain_failures >= MAX_DRAIN_FAILURES {
                return Err(error.context(format!(
                    "giving up draining session {} with {} unreported results",
                    self.info.session_id,
                    state.pending.len()
                )));
            }
        }
        Ok(None)
    }

    fn spawn_op(&self, op: Operation, workers: &Arc<Semaphore>, results: &mpsc::UnboundedSender<ExecutionResult>) {
        let ctx = self.ctx.clone();
        let workers = workers.clone();
        let results = results.clone();
        tokio::spawn(async move {
            let op = Arc::new(op);
            let result = match workers.acquire_owned().await {
                Ok(_permit) => execute_blocking(ctx, op).await,
                Err(e) => {
                    let mut result = ExecutionResult::failure(&op, now_ms(), format!("worker pool closed: {}", e));
                    result.exception = Some(e.to_string());
                    result
                }
            };
            // The loop may already have exited on kill.
            let _ = results.send(result);
        });
    }
}
