//! Message Group Processor
//!
//! Enforces FIFO, single-flight processing within one `(itemType, groupKey)`.
//! Items are drained in batches, sent through the HTTP dispatcher, and the
//! outcome is written back to the outbox repository: successes terminate,
//! retryable failures under budget loop back to PENDING via
//! `incrementRetryCount`, everything else becomes a terminal error status.

use std::collections::VecDeque;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::{Mutex, RwLock, Semaphore};
use relay_common::{OutboxItem, OutboxItemType, OutboxStatus};
use tracing::{debug, error};

use crate::http_dispatcher::OutboxBatchDispatcher;
use crate::repository::OutboxRepository;
use crate::enhanced_processor::ProcessorMetrics;

/// Configuration for a message group processor
#[derive(Debug, Clone)]
pub struct MessageGroupProcessorConfig {
    /// Maximum retry attempts before a retryable failure is collapsed to a
    /// terminal INTERNAL_ERROR.
    pub max_retries: i32,
    /// Items drained per API call.
    pub batch_size: usize,
}

impl Default for MessageGroupProcessorConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            batch_size: 100,
        }
    }
}

/// Processes one `(itemType, groupKey)` group: single worker active at a time,
/// guaranteeing FIFO delivery order within the group.
pub struct MessageGroupProcessor {
    item_type: OutboxItemType,
    group_key: String,
    config: MessageGroupProcessorConfig,
    queue: Arc<Mutex<VecDeque<OutboxItem>>>,
    running: Arc<AtomicBool>,
    dispatcher: Arc<dyn OutboxBatchDispatcher>,
    repository: Arc<dyn OutboxRepository>,
    /// Process-wide semaphore bounding concurrent API-call critical sections
    /// across ALL groups (size = maxConcurrentGroups).
    semaphore: Arc<Semaphore>,
    in_flight: Arc<AtomicU64>,
    metrics: Arc<RwLock<ProcessorMetrics>>,
}

impl MessageGroupProcessor {
    pub fn new(
        item_type: OutboxItemType,
        group_key: String,
        config: MessageGroupProcessorConfig,
        dispatcher: Arc<dyn OutboxBatchDispatcher>,
        repository: Arc<dyn OutboxRepository>,
        semaphore: Arc<Semaphore>,
        in_flight: Arc<AtomicU64>,
        metrics: Arc<RwLock<ProcessorMetrics>>,
    ) -> Self {
        Self {
            item_type,
            group_key,
            config,
            queue: Arc::new(Mutex::new(VecDeque::new())),
            running: Arc::new(AtomicBool::new(false)),
            dispatcher,
            repository,
            semaphore,
            in_flight,
            metrics,
        }
    }

    pub fn group_key(&self) -> &str {
        &self.group_key
    }

    pub fn item_type(&self) -> OutboxItemType {
        self.item_type
    }

    pub async fn queue_depth(&self) -> usize {
        self.queue.lock().await.len()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Enqueue an item and start the worker if it isn't already active.
    pub async fn enqueue(self: &Arc<Self>, item: OutboxItem) {
        {
            let mut queue = self.queue.lock().await;
            queue.push_back(item);
        }
        self.spawn_worker_if_idle();
    }

    fn spawn_worker_if_idle(self: &Arc<Self>) {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            let this = Arc::clone(self);
            tokio::spawn(async move {
                this.run_worker().await;
            });
        }
    }

    /// Drains the queue one batch at a time until empty, then yields the
    /// worker slot back. Re-checks the queue before exiting to close the
    /// enqueue race described by the group distributor's lifecycle.
    async fn run_worker(self: Arc<Self>) {
        loop {
            let batch = {
                let mut queue = self.queue.lock().await;
                let count = queue.len().min(self.config.batch_size.max(1));
                if count == 0 {
                    None
                } else {
                    Some(queue.drain(..count).collect::<Vec<_>>())
                }
            };

            let Some(batch) = batch else {
                self.running.store(false, Ordering::SeqCst);
                if self.queue.lock().await.is_empty() {
                    break;
                }
                if self
                    .running
                    .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                    .is_err()
                {
                    break;
                }
                continue;
            };

            self.process_batch(batch).await;
        }

        debug!(
            item_type = ?self.item_type,
            group_key = %self.group_key,
            "group worker exiting, queue drained"
        );
    }

    async fn process_batch(&self, batch: Vec<OutboxItem>) {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .expect("group processor semaphore closed");

        let batch_len = batch.len() as u64;
        debug!(
            item_type = ?self.item_type,
            group_key = %self.group_key,
            count = batch.len(),
            "dispatching batch"
        );

        let results = self.dispatcher.dispatch_outbox_batch(&batch).await;
        self.in_flight.fetch_sub(batch_len, Ordering::SeqCst);

        self.apply_outcomes(&batch, results).await;

        drop(permit);
    }

    /// Maps per-item outcomes into repository operations per the outbox
    /// retry contract: SUCCESS terminates, retryable-under-budget loops back
    /// to PENDING via `incrementRetryCount`, everything else (including
    /// retryable-but-exhausted, collapsed to INTERNAL_ERROR) is a terminal
    /// `markWithStatus`.
    async fn apply_outcomes(
        &self,
        batch: &[OutboxItem],
        results: Vec<crate::http_dispatcher::OutboxDispatchResult>,
    ) {
        let retry_counts: HashMap<&str, i32> =
            batch.iter().map(|item| (item.id.as_str(), item.retry_count)).collect();

        let mut success_ids = Vec::new();
        let mut retry_ids = Vec::new();
        let mut terminal: Vec<(String, OutboxStatus, Option<String>)> = Vec::new();

        for result in results {
            if result.status == OutboxStatus::SUCCESS {
                success_ids.push(result.id);
            } else if result.status.is_retryable() {
                let retry_count = retry_counts.get(result.id.as_str()).copied().unwrap_or(0);
                if retry_count < self.config.max_retries {
                    retry_ids.push(result.id);
                } else {
                    terminal.push((
                        result.id,
                        OutboxStatus::INTERNAL_ERROR,
                        Some("max retries exceeded".to_string()),
                    ));
                }
            } else {
                terminal.push((result.id, result.status, result.error_message));
            }
        }

        let succeeded = success_ids.len() as u64;
        let retried = retry_ids.len() as u64;
        let failed = terminal.len() as u64;

        if !success_ids.is_empty() {
            if let Err(e) = self
                .repository
                .mark_with_status(self.item_type, success_ids, OutboxStatus::SUCCESS, None)
                .await
            {
                error!(error = %e, "failed to mark items SUCCESS");
            }
        }

        if !retry_ids.is_empty() {
            if let Err(e) = self.repository.increment_retry_count(self.item_type, retry_ids).await {
                error!(error = %e, "failed to increment retry count");
            }
        }

        for (id, status, message) in terminal {
            if let Err(e) = self
                .repository
                .mark_with_status(self.item_type, vec![id], status, message)
                .await
            {
                error!(error = %e, "failed to mark item with terminal status");
            }
        }

        let mut m = self.metrics.write().await;
        m.items_processed += succeeded + retried + failed;
        m.items_succeeded += succeeded;
        m.items_failed += failed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http_dispatcher::OutboxDispatchResult;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::atomic::AtomicUsize;

    struct MockDispatcher {
        calls: AtomicUsize,
        fail_first_n_calls: usize,
    }

    #[async_trait]
    impl OutboxBatchDispatcher for MockDispatcher {
        async fn dispatch_outbox_batch(&self, items: &[OutboxItem]) -> Vec<OutboxDispatchResult> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            let status = if call < self.fail_first_n_calls {
                OutboxStatus::GATEWAY_ERROR
            } else {
                OutboxStatus::SUCCESS
            };
            items
                .iter()
                .map(|item| OutboxDispatchResult {
                    id: item.id.clone(),
                    status,
                    error_message: if status == OutboxStatus::SUCCESS {
                        None
                    } else {
                        Some("mock failure".to_string())
                    },
                })
                .collect()
        }
    }

    struct MockRepository {
        marked: Mutex<Vec<(String, OutboxStatus)>>,
        retried: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl OutboxRepository for MockRepository {
        async fn fetch_pending_by_type(&self, _: OutboxItemType, _: u32) -> anyhow::Result<Vec<OutboxItem>> {
            Ok(Vec::new())
        }
        async fn mark_in_progress(&self, _: OutboxItemType, _: Vec<String>) -> anyhow::Result<()> {
            Ok(())
        }
        async fn mark_with_status(
            &self,
            _: OutboxItemType,
            ids: Vec<String>,
            status: OutboxStatus,
            _: Option<String>,
        ) -> anyhow::Result<()> {
            let mut marked = self.marked.lock().await;
            for id in ids {
                marked.push((id, status));
            }
            Ok(())
        }
        async fn increment_retry_count(&self, _: OutboxItemType, ids: Vec<String>) -> anyhow::Result<()> {
            self.retried.lock().await.extend(ids);
            Ok(())
        }
        async fn fetch_recoverable_items(
            &self,
            _: OutboxItemType,
            _: std::time::Duration,
            _: u32,
        ) -> anyhow::Result<Vec<OutboxItem>> {
            Ok(Vec::new())
        }
        async fn reset_recoverable_items(&self, _: OutboxItemType, _: Vec<String>) -> anyhow::Result<()> {
            Ok(())
        }
        async fn fetch_stuck_items(
            &self,
            _: OutboxItemType,
            _: std::time::Duration,
            _: u32,
        ) -> anyhow::Result<Vec<OutboxItem>> {
            Ok(Vec::new())
        }
        async fn reset_stuck_items(&self, _: OutboxItemType, _: Vec<String>) -> anyhow::Result<()> {
            Ok(())
        }
        async fn init_schema(&self) -> anyhow::Result<()> {
            Ok(())
        }
        fn table_config(&self) -> &crate::repository::OutboxTableConfig {
            unimplemented!("not needed for these tests")
        }
    }

    fn test_item(id: &str, retry_count: i32) -> OutboxItem {
        OutboxItem {
            id: id.to_string(),
            item_type: OutboxItemType::EVENT,
            message_group: Some("group-1".to_string()),
            payload: serde_json::Value::Null,
            status: OutboxStatus::IN_PROGRESS,
            retry_count,
            created_at: Utc::now(),
            updated_at: None,
            error_message: None,
            pool_code: None,
            mediation_target: None,
        }
    }

    fn make_processor(
        dispatcher: Arc<MockDispatcher>,
        repository: Arc<MockRepository>,
        config: MessageGroupProcessorConfig,
    ) -> Arc<MessageGroupProcessor> {
        Arc::new(MessageGroupProcessor::new(
            OutboxItemType::EVENT,
            "group-1".to_string(),
            config,
            dispatcher,
            repository,
            Arc::new(Semaphore::new(4)),
            Arc::new(AtomicU64::new(0)),
            Arc::new(RwLock::new(ProcessorMetrics::default())),
        ))
    }

    #[tokio::test]
    async fn success_marks_items_success() {
        let dispatcher = Arc::new(MockDispatcher { calls: AtomicUsize::new(0), fail_first_n_calls: 0 });
        let repository = Arc::new(MockRepository { marked: Mutex::new(Vec::new()), retried: Mutex::new(Vec::new()) });
        let processor = make_processor(dispatcher, repository.clone(), MessageGroupProcessorConfig::default());

        processor.enqueue(test_item("item-1", 0)).await;
        processor.enqueue(test_item("item-2", 0)).await;

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let marked = repository.marked.lock().await;
        assert_eq!(marked.len(), 2);
        assert!(marked.iter().all(|(_, status)| *status == OutboxStatus::SUCCESS));
    }

    #[tokio::test]
    async fn retryable_failure_under_budget_increments_retry_count() {
        let dispatcher = Arc::new(MockDispatcher { calls: AtomicUsize::new(0), fail_first_n_calls: 1 });
        let repository = Arc::new(MockRepository { marked: Mutex::new(Vec::new()), retried: Mutex::new(Vec::new()) });
        let processor = make_processor(dispatcher, repository.clone(), MessageGroupProcessorConfig::default());

        processor.enqueue(test_item("item-1", 0)).await;

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let retried = repository.retried.lock().await;
        assert_eq!(retried.as_slice(), ["item-1".to_string()]);
        assert!(repository.marked.lock().await.is_empty());
    }

    #[tokio::test]
    async fn retryable_failure_over_budget_collapses_to_internal_error() {
        let dispatcher = Arc::new(MockDispatcher { calls: AtomicUsize::new(0), fail_first_n_calls: 1 });
        let repository = Arc::new(MockRepository { marked: Mutex::new(Vec::new()), retried: Mutex::new(Vec::new()) });
        let config = MessageGroupProcessorConfig { max_retries: 3, batch_size: 100 };
        let processor = make_processor(dispatcher, repository.clone(), config);

        // retry_count already at the limit: first failure is exhausted, not retryable
        processor.enqueue(test_item("item-1", 3)).await;

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let marked = repository.marked.lock().await;
        assert_eq!(marked.as_slice(), [("item-1".to_string(), OutboxStatus::INTERNAL_ERROR)]);
        assert!(repository.retried.lock().await.is_empty());
    }
}
