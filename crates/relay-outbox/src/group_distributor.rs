//! Group Distributor
//!
//! Process-wide map `(itemType, groupKey) -> MessageGroupProcessor`. Items
//! without a `message_group` are routed to a singleton group keyed by their
//! own id, so every item still flows through the same repository-driven
//! outcome pipeline; they simply never contend with another item for FIFO
//! ordering.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use tokio::sync::{RwLock, Semaphore};
use relay_common::{OutboxItem, OutboxItemType};
use tracing::info;

use crate::enhanced_processor::ProcessorMetrics;
use crate::http_dispatcher::OutboxBatchDispatcher;
use crate::message_group_processor::{MessageGroupProcessor, MessageGroupProcessorConfig};
use crate::repository::OutboxRepository;

type GroupKey = (OutboxItemType, String);

/// Group distributor configuration
#[derive(Debug, Clone)]
pub struct GroupDistributorConfig {
    /// Config for individual message group processors
    pub processor_config: MessageGroupProcessorConfig,
    /// Maximum number of tracked group processor entries (map capacity, not
    /// a concurrency bound -- that's `maxConcurrentGroups` / the shared
    /// semaphore).
    pub max_groups: usize,
    /// Idle timeout before a group entry is evicted from the map (seconds).
    pub group_idle_timeout_secs: u64,
}

impl Default for GroupDistributorConfig {
    fn default() -> Self {
        Self {
            processor_config: MessageGroupProcessorConfig::default(),
            max_groups: 10000,
            group_idle_timeout_secs: 300,
        }
    }
}

struct GroupEntry {
    processor: Arc<MessageGroupProcessor>,
    last_activity: std::time::Instant,
}

/// Statistics for the distributor
#[derive(Debug, Clone, Default)]
pub struct DistributorStats {
    pub active_groups: usize,
    pub total_items_distributed: u64,
}

/// Routes outbox items to per-`(itemType, groupKey)` processors and bounds
/// how many of them may be in their API-call critical section at once via a
/// shared semaphore.
pub struct GroupDistributor {
    config: GroupDistributorConfig,
    dispatcher: Arc<dyn OutboxBatchDispatcher>,
    repository: Arc<dyn OutboxRepository>,
    semaphore: Arc<Semaphore>,
    in_flight: Arc<AtomicU64>,
    metrics: Arc<RwLock<ProcessorMetrics>>,
    groups: RwLock<HashMap<GroupKey, GroupEntry>>,
    stats: RwLock<DistributorStats>,
}

impl GroupDistributor {
    pub fn new(
        config: GroupDistributorConfig,
        dispatcher: Arc<dyn OutboxBatchDispatcher>,
        repository: Arc<dyn OutboxRepository>,
        semaphore: Arc<Semaphore>,
        in_flight: Arc<AtomicU64>,
        metrics: Arc<RwLock<ProcessorMetrics>>,
    ) -> Self {
        Self {
            config,
            dispatcher,
            repository,
            semaphore,
            in_flight,
            metrics,
            groups: RwLock::new(HashMap::new()),
            stats: RwLock::new(DistributorStats::default()),
        }
    }

    /// Enqueue an item onto its group's processor, creating one if needed.
    pub async fn distribute(&self, item: OutboxItem) {
        let group_key = item.message_group.clone().unwrap_or_else(|| item.id.clone());
        let key = (item.item_type, group_key);

        let processor = self.get_or_create_processor(key).await;
        processor.enqueue(item).await;

        let mut stats = self.stats.write().await;
        stats.total_items_distributed += 1;
    }

    async fn get_or_create_processor(&self, key: GroupKey) -> Arc<MessageGroupProcessor> {
        {
            let groups = self.groups.read().await;
            if let Some(entry) = groups.get(&key) {
                return Arc::clone(&entry.processor);
            }
        }

        let mut groups = self.groups.write().await;
        if let Some(entry) = groups.get(&key) {
            return Arc::clone(&entry.processor);
        }

        if groups.len() >= self.config.max_groups {
            self.evict_idle_internal(&mut groups).await;
        }

        let processor = Arc::new(MessageGroupProcessor::new(
            key.0,
            key.1.clone(),
            self.config.processor_config.clone(),
            Arc::clone(&self.dispatcher),
            Arc::clone(&self.repository),
            Arc::clone(&self.semaphore),
            Arc::clone(&self.in_flight),
            Arc::clone(&self.metrics),
        ));

        groups.insert(
            key.clone(),
            GroupEntry {
                processor: Arc::clone(&processor),
                last_activity: std::time::Instant::now(),
            },
        );

        info!(item_type = ?key.0, group_key = %key.1, "created message group processor");

        processor
    }

    async fn evict_idle_internal(&self, groups: &mut HashMap<GroupKey, GroupEntry>) {
        let threshold = std::time::Duration::from_secs(self.config.group_idle_timeout_secs);
        let now = std::time::Instant::now();

        let idle_keys: Vec<GroupKey> = groups
            .iter()
            .filter(|(_, entry)| now.duration_since(entry.last_activity) > threshold)
            .map(|(k, _)| k.clone())
            .collect();

        for key in idle_keys {
            if let Some(entry) = groups.get(&key) {
                if !entry.processor.is_running() && entry.processor.queue_depth().await == 0 {
                    groups.remove(&key);
                }
            }
        }
    }

    /// Remove idle, empty group entries from the map.
    pub async fn cleanup_idle_groups(&self) {
        let mut groups = self.groups.write().await;
        self.evict_idle_internal(&mut groups).await;

        let mut stats = self.stats.write().await;
        stats.active_groups = groups.len();
    }

    pub async fn stats(&self) -> DistributorStats {
        let stats = self.stats.read().await;
        let groups = self.groups.read().await;
        DistributorStats {
            active_groups: groups.len(),
            ..stats.clone()
        }
    }

    pub async fn active_groups(&self) -> Vec<(OutboxItemType, String)> {
        let groups = self.groups.read().await;
        groups.keys().cloned().collect()
    }

    pub async fn group_queue_depth(&self, item_type: OutboxItemType, group_key: &str) -> Option<usize> {
        let groups = self.groups.read().await;
        match groups.get(&(item_type, group_key.to_string())) {
            Some(entry) => Some(entry.processor.queue_depth().await),
            None => None,
        }
    }

    /// Drop all tracked group entries. Any batch already in flight inside a
    /// worker task runs to completion independently (the worker holds its
    /// own `Arc` clones), so in-flight items are never abandoned mid-write.
    pub async fn shutdown(&self) {
        let mut groups = self.groups.write().await;
        let count = groups.len();
        groups.clear();
        info!(count, "group distributor shutdown, entries cleared");
    }
}
