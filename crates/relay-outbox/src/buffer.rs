//! Global Buffer
//!
//! A thread-safe buffer that collects messages from multiple sources before distribution.
//!
//! When the buffer is full, messages are rejected (not dropped). The message remains
//! in its PROCESSING state in the database and will be recovered by the crash recovery
//! task after the configured timeout.

use std::collections::VecDeque;
use std::sync::Arc;
use std::fmt;
use tokio::sync::{Mutex, mpsc};
use relay_common::OutboxItem;
use tracing::{debug, warn};

/// Error returned when the buffer is full.
///
/// This is NOT a data loss scenario - the message remains in PROCESSING state
/// in the database and will be recovered by the crash recovery task.
#[derive(Debug, Clone)]
pub struct BufferFullError {
    pub message_id: String,
}

impl fmt::Display for BufferFullError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Buffer full, message {} rejected (will be recovered from PROCESSING state)",
            self.message_id
        )
    }
}

impl std::error::Error for BufferFullError {}

/// Global buffer configuration
#[derive(Debug, Clone)]
pub struct GlobalBufferConfig {
    /// Maximum buffer size. When exceeded, new messages are rejected (not dropped).
    /// Rejected messages remain in PROCESSING state and are recovered by crash recovery.
    pub max_size: usize,
    /// Batch size for draining
    pub batch_size: usize,
}

impl Default for GlobalBufferConfig {
    fn default() -> Self {
        Self {
            max_size: 10000,
            batch_size: 100,
        }
    }
}

/// Global buffer for collecting outbox items before distribution
pub struct GlobalBuffer {
    config: GlobalBufferConfig,
    buffer: Arc<Mutex<VecDeque<OutboxItem>>>,
    sender: mpsc::Sender<OutboxItem>,
    receiver: Arc<Mutex<mpsc::Receiver<OutboxItem>>>,
}

impl GlobalBuffer {
    pub fn new(config: GlobalBufferConfig) -> Self {
        let (sender, receiver) = mpsc::channel(config.max_size);
        Self {
            config,
            buffer: Arc::new(Mutex::new(VecDeque::new())),
            sender,
            receiver: Arc::new(Mutex::new(receiver)),
        }
    }

    /// Get a sender handle for pushing items
    pub fn sender(&self) -> mpsc::Sender<OutboxItem> {
        self.sender.clone()
    }

    /// Push an item to the buffer.
    ///
    /// Returns `BufferFullError` if the buffer is at capacity. This is NOT a data loss
    /// scenario - the item remains in IN_PROGRESS state in the database and will be
    /// recovered by the crash recovery task after the configured timeout.
    pub async fn push(&self, item: OutboxItem) -> Result<(), BufferFullError> {
        let mut buffer = self.buffer.lock().await;
        if buffer.len() >= self.config.max_size {
            warn!(
                "Global buffer full (capacity: {}), item {} rejected - will be recovered from IN_PROGRESS state",
                self.config.max_size,
                item.id
            );
            return Err(BufferFullError {
                message_id: item.id,
            });
        }
        buffer.push_back(item);
        debug!("Item added to global buffer, size: {}", buffer.len());
        Ok(())
    }

    /// Drain up to batch_size items from the buffer
    pub async fn drain_batch(&self) -> Vec<OutboxItem> {
        let mut buffer = self.buffer.lock().await;
        let count = buffer.len().min(self.config.batch_size);
        let mut batch = Vec::with_capacity(count);
        for _ in 0..count {
            if let Some(item) = buffer.pop_front() {
                batch.push(item);
            }
        }
        debug!("Drained {} items from global buffer", batch.len());
        batch
    }

    /// Get current buffer size
    pub async fn len(&self) -> usize {
        let buffer = self.buffer.lock().await;
        buffer.len()
    }

    /// Check if buffer is empty
    pub async fn is_empty(&self) -> bool {
        let buffer = self.buffer.lock().await;
        buffer.is_empty()
    }

    /// Process incoming items from the channel
    pub async fn process_incoming(&self) {
        let mut receiver = self.receiver.lock().await;
        while let Some(item) = receiver.recv().await {
            let _ = self.push(item).await;
        }
    }
}
