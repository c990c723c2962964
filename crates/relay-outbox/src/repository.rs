//! Outbox Repository Trait
//!
//! Defines the interface for outbox persistence.
//! Supports type-aware queries (EVENT vs DISPATCH_JOB) and granular status tracking.

use async_trait::async_trait;
use relay_common::{OutboxItem, OutboxItemType, OutboxStatus};
use anyhow::Result;
use std::time::Duration;

/// Configuration for outbox repository tables
#[derive(Debug, Clone)]
pub struct OutboxTableConfig {
    /// Table name for EVENT items (default: "outbox_events")
    pub events_table: String,
    /// Table name for DISPATCH_JOB items (default: "outbox_dispatch_jobs")
    pub dispatch_jobs_table: String,
}

impl Default for OutboxTableConfig {
    fn default() -> Self {
        Self {
            events_table: "outbox_events".to_string(),
            dispatch_jobs_table: "outbox_dispatch_jobs".to_string(),
        }
    }
}

impl OutboxTableConfig {
    /// Get table name for item type
    pub fn table_for_type(&self, item_type: OutboxItemType) -> &str {
        match item_type {
            OutboxItemType::EVENT => &self.events_table,
            OutboxItemType::DISPATCH_JOB => &self.dispatch_jobs_table,
        }
    }
}

/// Outbox repository trait
#[async_trait]
pub trait OutboxRepository: Send + Sync {
    // ========================================================================
    // Core Operations
    // ========================================================================

    /// Fetch pending items of the specified type
    async fn fetch_pending_by_type(&self, item_type: OutboxItemType, limit: u32) -> Result<Vec<OutboxItem>>;

    /// Mark items as IN_PROGRESS (status = 9)
    async fn mark_in_progress(&self, item_type: OutboxItemType, ids: Vec<String>) -> Result<()>;

    /// Update status for items with optional error message
    async fn mark_with_status(
        &self,
        item_type: OutboxItemType,
        ids: Vec<String>,
        status: OutboxStatus,
        error_message: Option<String>,
    ) -> Result<()>;

    /// Increment retry count and reset to PENDING for retry
    async fn increment_retry_count(&self, item_type: OutboxItemType, ids: Vec<String>) -> Result<()>;

    /// Fetch items that are recoverable (stuck in IN_PROGRESS or error states)
    async fn fetch_recoverable_items(
        &self,
        item_type: OutboxItemType,
        timeout: Duration,
        limit: u32,
    ) -> Result<Vec<OutboxItem>>;

    /// Reset recoverable items back to PENDING
    async fn reset_recoverable_items(&self, item_type: OutboxItemType, ids: Vec<String>) -> Result<()>;

    /// Fetch items stuck in IN_PROGRESS for longer than timeout
    async fn fetch_stuck_items(
        &self,
        item_type: OutboxItemType,
        timeout: Duration,
        limit: u32,
    ) -> Result<Vec<OutboxItem>>;

    /// Reset stuck items back to PENDING
    async fn reset_stuck_items(&self, item_type: OutboxItemType, ids: Vec<String>) -> Result<()>;

    // ========================================================================
    // Schema Management
    // ========================================================================

    /// Initialize schema (create tables if not exists)
    async fn init_schema(&self) -> Result<()>;

    /// Get the table configuration
    fn table_config(&self) -> &OutboxTableConfig;
}

/// Extension trait for batch operations
#[async_trait]
pub trait OutboxRepositoryExt: OutboxRepository {
    /// Process a batch of items with status update
    async fn process_batch(
        &self,
        item_type: OutboxItemType,
        _items: &[OutboxItem],
        results: Vec<(String, OutboxStatus, Option<String>)>,
    ) -> Result<()> {
        // Group by status
        let mut success_ids = Vec::new();
        let mut error_items: Vec<(String, OutboxStatus, Option<String>)> = Vec::new();

        for (id, status, error) in results {
            if status.is_terminal() && matches!(status, OutboxStatus::SUCCESS) {
                success_ids.push(id);
            } else {
                error_items.push((id, status, error));
            }
        }

        // Mark successful items
        if !success_ids.is_empty() {
            self.mark_with_status(item_type, success_ids, OutboxStatus::SUCCESS, None).await?;
        }

        // Handle error items individually (they may have different statuses)
        for (id, status, error) in error_items {
            self.mark_with_status(item_type, vec![id], status, error).await?;
        }

        Ok(())
    }

    /// Retry failed items that haven't exceeded max retries
    async fn retry_failed_items(
        &self,
        item_type: OutboxItemType,
        max_retries: i32,
        limit: u32,
    ) -> Result<u64> {
        let recoverable = self.fetch_recoverable_items(item_type, Duration::from_secs(0), limit).await?;

        let mut retried = 0u64;
        let mut to_retry = Vec::new();
        let mut exhausted = Vec::new();

        for item in recoverable {
            if item.retry_count < max_retries {
                to_retry.push(item.id);
            } else {
                exhausted.push(item.id);
            }
        }

        if !to_retry.is_empty() {
            retried = to_retry.len() as u64;
            self.increment_retry_count(item_type, to_retry).await?;
        }

        // Mark exhausted items as permanently failed
        if !exhausted.is_empty() {
            self.mark_with_status(
                item_type,
                exhausted,
                OutboxStatus::INTERNAL_ERROR,
                Some("Max retries exceeded".to_string()),
            ).await?;
        }

        Ok(retried)
    }
}

// Blanket implementation
impl<T: OutboxRepository + ?Sized> OutboxRepositoryExt for T {}
