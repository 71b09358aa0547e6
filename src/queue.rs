//! Bounded event queue between capture callbacks and the delivery worker.
//!
//! Producers are the proxy's capture callbacks, possibly many threads at
//! once. The single consumer is the delivery worker. Order is FIFO, so
//! events of one flow reach the transport in capture order.

use thiserror::Error;
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::sync::mpsc::{self, error::TrySendError};

use crate::event::OutboundEvent;

/// Default queue capacity.
pub const DEFAULT_CAPACITY: usize = 1000;

/// What a producer does when the queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum QueueFullPolicy {
    /// Wait for the worker to free a slot
    #[default]
    Block,
    /// Drop the event being enqueued
    DropNewest,
}

/// Reasons an event did not make it onto the queue.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueError {
    /// Queue at capacity under the drop policy
    #[error("event queue is full")]
    Full,

    /// Worker has shut down
    #[error("event queue is closed")]
    Closed,

    /// Queue full under the blocking policy, but the caller runs on a
    /// current-thread runtime and cannot wait
    #[error("event queue is full and the current-thread runtime cannot block")]
    CannotBlock,
}

/// Producer side. Cheap to clone.
#[derive(Debug, Clone)]
pub struct EventQueue {
    tx: mpsc::Sender<OutboundEvent>,
    policy: QueueFullPolicy,
}

/// Consumer side, owned by the delivery worker.
#[derive(Debug)]
pub struct EventReceiver {
    rx: mpsc::Receiver<OutboundEvent>,
}

/// Create a queue holding at most `capacity` events.
///
/// # Panics
///
/// Panics if `capacity` is zero; configuration validation rejects that
/// before a queue is built.
pub fn bounded(capacity: usize, policy: QueueFullPolicy) -> (EventQueue, EventReceiver) {
    let (tx, rx) = mpsc::channel(capacity);
    (EventQueue { tx, policy }, EventReceiver { rx })
}

impl EventQueue {
    /// Enqueue from a synchronous capture callback.
    ///
    /// Under [`QueueFullPolicy::Block`] this parks the calling thread until
    /// a slot frees up. Inside a multi-threaded tokio runtime the wait is
    /// moved off the worker thread with `block_in_place`; a current-thread
    /// runtime cannot block, so the event is dropped with
    /// [`EnqueueError::CannotBlock`].
    pub fn enqueue_blocking(&self, event: OutboundEvent) -> Result<(), EnqueueError> {
        match self.policy {
            QueueFullPolicy::DropNewest => self.try_enqueue(event),
            QueueFullPolicy::Block => match Handle::try_current() {
                Err(_) => self.tx.blocking_send(event).map_err(|_| EnqueueError::Closed),
                Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
                    tokio::task::block_in_place(|| self.tx.blocking_send(event))
                        .map_err(|_| EnqueueError::Closed)
                }
                Ok(_) => self.try_enqueue(event).map_err(|e| match e {
                    EnqueueError::Full => EnqueueError::CannotBlock,
                    other => other,
                }),
            },
        }
    }

    /// Enqueue from async code, applying the configured policy.
    pub async fn enqueue(&self, event: OutboundEvent) -> Result<(), EnqueueError> {
        match self.policy {
            QueueFullPolicy::DropNewest => self.try_enqueue(event),
            QueueFullPolicy::Block => self.tx.send(event).await.map_err(|_| EnqueueError::Closed),
        }
    }

    /// Enqueue without waiting.
    pub fn try_enqueue(&self, event: OutboundEvent) -> Result<(), EnqueueError> {
        self.tx.try_send(event).map_err(|e| match e {
            TrySendError::Full(_) => EnqueueError::Full,
            TrySendError::Closed(_) => EnqueueError::Closed,
        })
    }

    /// Configured full-queue policy.
    pub fn policy(&self) -> QueueFullPolicy {
        self.policy
    }

    /// Events currently waiting.
    pub fn len(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    /// Whether no event is waiting.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of waiting events.
    pub fn capacity(&self) -> usize {
        self.tx.max_capacity()
    }

    /// Whether the worker stopped accepting events.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl EventReceiver {
    /// Wait for the next event. `None` once closed and drained.
    pub async fn recv(&mut self) -> Option<OutboundEvent> {
        self.rx.recv().await
    }

    /// Blocking variant for non-async consumers.
    pub fn blocking_recv(&mut self) -> Option<OutboundEvent> {
        self.rx.blocking_recv()
    }

    /// Refuse further events while keeping queued ones receivable.
    pub fn close(&mut self) {
        self.rx.close();
    }
}

// ============================================================================
// Tests
// ============================================================================
