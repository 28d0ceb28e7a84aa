//! Execution Queue and Distributed Polling Module
//!
//! Schedules, distributes and accounts for file-copy operations executed either
//! in-process or by remote executor processes.
//!
//! ## Architecture Overview
//! The system follows a **Pull-based** model with **Session** liveness:
//! 1. **Submission**: operations are added to a per-job `ExecutionQueue`, optionally
//!    backed by a `PersistedQueue` so pending work survives a restart.
//! 2. **Local execution**: a `BatchPoller` drains a queue into cost-bounded batches
//!    and hands them to a `BatchExecutor` under a bounded number of slots.
//! 3. **Remote execution**: executor processes open a session with the
//!    `ExecutorSessionRegistry`, then poll for work and report results in the same
//!    round trip. A session that stops pinging is expired and its operations go
//!    back to the front of their queues (at-least-once semantics).
//!
//! ## Submodules
//! - **`queue`**: per-job state machine (queued, running, done, error) and cost accounting.
//! - **`journal`**: done and error logs written from queue events.
//! - **`persisted`**: queue recovery from the remaining-ops file and checkpointing.
//! - **`runner`**: batch poller and the local worker-pool executor.
//! - **`registry`**: server-side job table with per-job polling switches.
//! - **`session`**: executor session lifecycle, ownership and failover.
//! - **`protocol`** / **`handlers`**: HTTP API contracts and axum handlers.
//! - **`client`** / **`executor`**: the executor process side of the polling RPC.

pub mod types;
pub mod queue;
pub mod journal;
pub mod persisted;
pub mod runner;
pub mod registry;
pub mod session;
pub mod protocol;
pub mod handlers;
pub mod client;
pub mod executor;

#[cfg(test)]
mod tests;
