//! Durable, ordered message queue (spec.md §4.1).
//!
//! A queue persists enqueued messages in delivery order and dispatches them
//! to a [`MessageListener`] with bounded concurrency, retrying failed
//! attempts with a fixed delay up to a configured limit before
//! dead-lettering (abandoning) the message. The single implementation here,
//! [`sqlite::SqliteQueue`], mirrors the polling/claim pattern the teacher
//! crate's `fc-queue::sqlite::SqliteQueue` used for its SQS-compatible dev
//! queue, adapted from visibility-timeout semantics to the attempts/
//! acknowledged/abandoned row model this system specifies.

pub mod error;
pub mod sqlite;

pub use error::{QueueError, Result};

use async_trait::async_trait;
use pb_common::{Message, Principal};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Per-queue dispatch policy (spec.md §3 `QueueOptions`).
#[derive(Debug, Clone)]
pub struct QueueOptions {
    /// Number of messages dispatched concurrently. Must be at least 1.
    pub concurrency_limit: u32,
    /// If true, a message is acknowledged automatically unless the listener
    /// explicitly leaves it unacknowledged by returning an error.
    pub auto_acknowledge: bool,
    /// Attempts (including the first) before a message is abandoned.
    pub max_attempts: u32,
    /// Delay between a failed attempt and the next one.
    pub retry_delay: Duration,
    /// Time-to-live applied at enqueue time, capping the issued security
    /// token's expiry. `None` means messages and tokens never expire.
    pub ttl: Option<Duration>,
    /// Bounded capacity of the in-memory dispatch handoff. `None` means
    /// unbounded (enqueue never fails with `QueueFull`).
    pub handoff_buffer: Option<usize>,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            concurrency_limit: 4,
            auto_acknowledge: false,
            max_attempts: 10,
            retry_delay: Duration::from_secs(1),
            ttl: None,
            handoff_buffer: None,
        }
    }
}

/// Handed to a [`MessageListener`] for the duration of one delivery attempt.
///
/// Calling [`DeliveryContext::acknowledge`] marks the attempt successful;
/// not calling it (and the listener returning `Ok`) only acknowledges the
/// message if the queue's `auto_acknowledge` option is set.
#[derive(Debug, Default)]
pub struct DeliveryContext {
    acknowledged: AtomicBool,
}

impl DeliveryContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acknowledge(&self) {
        self.acknowledged.store(true, Ordering::SeqCst);
    }

    pub fn is_acknowledged(&self) -> bool {
        self.acknowledged.load(Ordering::SeqCst)
    }
}

/// A listener error counts as a failed, unacknowledged attempt — the same
/// outcome as the listener simply not calling `acknowledge`.
#[derive(Debug, thiserror::Error)]
#[error("listener failed: {0}")]
pub struct ListenerError(pub String);

/// Receives messages dispatched by a queue.
#[async_trait]
pub trait MessageListener: Send + Sync {
    async fn message_received(
        &self,
        message: Message,
        principal: Option<Principal>,
        context: &DeliveryContext,
        cancel: CancellationToken,
    ) -> std::result::Result<(), ListenerError>;
}

/// A durable queue accepting new messages for later dispatch.
#[async_trait]
pub trait Queue: Send + Sync {
    /// Persists `message` for dispatch, reconstituting `principal` from the
    /// `SecurityToken` header on dequeue rather than storing it directly.
    async fn enqueue(&self, message: Message, principal: Option<Principal>) -> Result<()>;

    /// Stops dispatching new attempts. In-flight attempts run to completion
    /// or respond to the cancellation token passed to the listener.
    async fn close(&self);
}
