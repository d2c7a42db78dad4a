//! Buffered message ingestion with drop-oldest backpressure.
//!
//! Senders never wait on the database: [`IngestionQueue::enqueue`] is a
//! synchronous push into a bounded in-memory queue, and a single background
//! consumer drains it into the store one message at a time, preserving
//! per-chat submission order.  When the queue is full the **oldest**
//! unprocessed message is discarded, trading history completeness for sender
//! latency under overload.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use rencontre_store::Message;

use crate::error::{ChatError, Result};
use crate::store_gateway::StoreGateway;

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

struct QueueState {
    items: VecDeque<Message>,
    accepting: bool,
}

/// Bounded FIFO with drop-oldest overflow.
///
/// Kept separate from the consumer so backpressure behavior is observable
/// on its own.
pub struct IngestionQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    capacity: usize,
}

impl IngestionQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                accepting: true,
            }),
            notify: Notify::new(),
            capacity: capacity.max(1),
        }
    }

    /// Push a message without blocking.
    ///
    /// Fails only once shutdown has begun; overflow silently discards the
    /// oldest queued message instead.
    pub fn enqueue(&self, message: Message) -> Result<()> {
        let dropped = {
            let mut state = self.state.lock();
            if !state.accepting {
                return Err(ChatError::ShuttingDown);
            }
            state.items.push_back(message);
            let mut dropped = 0usize;
            while state.items.len() > self.capacity {
                state.items.pop_front();
                dropped += 1;
            }
            dropped
        };

        if dropped > 0 {
            warn!(dropped, capacity = self.capacity, "ingestion queue full, dropped oldest");
        }
        self.notify.notify_one();
        Ok(())
    }

    /// Pop the oldest queued message, if any.
    pub fn try_dequeue(&self) -> Option<Message> {
        self.state.lock().items.pop_front()
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().items.is_empty()
    }

    /// Stop accepting new work.  Already queued messages stay drainable.
    fn close(&self) {
        self.state.lock().accepting = false;
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// The queue plus its background consumer.
pub struct IngestionPipeline {
    queue: Arc<IngestionQueue>,
    cancel: CancellationToken,
    consumer: Mutex<Option<JoinHandle<()>>>,
    drain_grace: Duration,
}

impl IngestionPipeline {
    /// Spawn the consumer and return the running pipeline.
    pub fn start(store: StoreGateway, capacity: usize, drain_grace: Duration) -> Self {
        let queue = Arc::new(IngestionQueue::new(capacity));
        let cancel = CancellationToken::new();
        let consumer = tokio::spawn(consume(queue.clone(), store, cancel.clone()));

        Self {
            queue,
            cancel,
            consumer: Mutex::new(Some(consumer)),
            drain_grace,
        }
    }

    /// Submit a message for durable persistence.  Non-blocking.
    pub fn enqueue(&self, message: Message) -> Result<()> {
        self.queue.enqueue(message)
    }

    /// Messages accepted but not yet handed to the store.
    pub fn backlog(&self) -> usize {
        self.queue.len()
    }

    /// Graceful shutdown: stop accepting, give the consumer up to the drain
    /// grace period to finish the backlog, then cancel it and wait for the
    /// task to exit.
    pub async fn shutdown(&self) {
        self.queue.close();

        let deadline = tokio::time::Instant::now() + self.drain_grace;
        while !self.queue.is_empty() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let remaining = self.queue.len();
        if remaining > 0 {
            warn!(remaining, "drain grace expired with messages still queued");
        }

        self.cancel.cancel();
        let handle = self.consumer.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

/// Single consumer loop: drain everything available, then sleep until the
/// next enqueue or cancellation.
async fn consume(queue: Arc<IngestionQueue>, store: StoreGateway, cancel: CancellationToken) {
    loop {
        while let Some(message) = queue.try_dequeue() {
            match store.insert_message(message.clone()).await {
                Ok(true) => {}
                Ok(false) => {
                    debug!(message = %message.id, "duplicate message id, insert ignored");
                }
                Err(e) => {
                    // No retry: the message is dropped and the failure logged.
                    warn!(message = %message.id, error = %e, "failed to persist message");
                }
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("ingestion consumer stopped");
                return;
            }
            _ = queue.notify.notified() => {}
        }
    }
}
