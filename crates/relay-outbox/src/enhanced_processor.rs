//! Enhanced Outbox Processor
//!
//! - Polls the outbox repository for PENDING items, per type (EVENT,
//!   DISPATCH_JOB), subject to maxInFlight backpressure.
//! - Routes polled items through a GlobalBuffer into a GroupDistributor,
//!   which enforces per-`(itemType, groupKey)` FIFO single-flight delivery.
//! - Delivers batches to the Relay HTTP API and writes outcomes back to the
//!   repository (SUCCESS / incrementRetryCount / terminal error status).
//! - Runs startup-once-off stuck-item recovery on becoming leader, and a
//!   separate periodic recoverable-item sweep, both leader-gated.
//! - Supports hot standby via the relay-standby crate.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{RwLock, Semaphore};
use relay_common::OutboxItemType;
use tracing::{info, debug, warn, error};

use crate::repository::OutboxRepository;
use crate::buffer::{GlobalBuffer, GlobalBufferConfig};
use crate::group_distributor::{GroupDistributor, GroupDistributorConfig, DistributorStats};
use crate::message_group_processor::MessageGroupProcessorConfig;
use crate::http_dispatcher::{HttpDispatcher, HttpDispatcherConfig};
use crate::LeaderElectionConfig;

#[cfg(feature = "standby")]
use relay_standby::{LeaderElection, LeadershipStatus};

const ITEM_TYPES: [OutboxItemType; 2] = [OutboxItemType::EVENT, OutboxItemType::DISPATCH_JOB];

/// Enhanced outbox processor configuration
#[derive(Debug, Clone)]
pub struct EnhancedProcessorConfig {
    /// Polling interval
    pub poll_interval: Duration,
    /// Items fetched per poll, per type
    pub poll_batch_size: u32,
    /// Items sent per API call
    pub api_batch_size: usize,
    /// Size of the shared semaphore bounding concurrent in-flight groups
    /// across the whole process (maxConcurrentGroups).
    pub max_concurrent_groups: usize,
    /// Global buffer capacity
    pub global_buffer_size: usize,
    /// Maximum items in flight across both types (backpressure)
    pub max_in_flight: u64,
    /// Maximum retry attempts before a retryable failure is collapsed to a
    /// terminal error
    pub max_retries: u32,
    /// IN_PROGRESS age (seconds) after which an item is considered stuck /
    /// recoverable
    pub processing_timeout_seconds: u64,
    /// Periodic recoverable-item sweep interval
    pub recovery_interval: Duration,
    /// HTTP dispatcher config
    pub http_config: HttpDispatcherConfig,
    /// Leader election config
    pub leader_election: LeaderElectionConfig,
}

impl Default for EnhancedProcessorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            poll_batch_size: 500,
            api_batch_size: 100,
            max_concurrent_groups: 10,
            global_buffer_size: 1000,
            max_in_flight: 5000,
            max_retries: 3,
            processing_timeout_seconds: 300,
            recovery_interval: Duration::from_secs(60),
            http_config: HttpDispatcherConfig::default(),
            leader_election: LeaderElectionConfig::default(),
        }
    }
}

/// Processor metrics
#[derive(Debug, Clone, Default)]
pub struct ProcessorMetrics {
    pub items_polled: u64,
    pub items_processed: u64,
    pub items_succeeded: u64,
    pub items_failed: u64,
    pub items_recovered: u64,
    pub current_in_flight: u64,
    pub buffer_size: usize,
    pub active_groups: usize,
}

/// Enhanced outbox processor
pub struct EnhancedOutboxProcessor {
    config: EnhancedProcessorConfig,
    repository: Arc<dyn OutboxRepository>,
    buffer: Arc<GlobalBuffer>,
    distributor: Arc<GroupDistributor>,
    in_flight: Arc<AtomicU64>,
    is_primary: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
    metrics: Arc<RwLock<ProcessorMetrics>>,
}

impl EnhancedOutboxProcessor {
    pub fn new(
        config: EnhancedProcessorConfig,
        repository: Arc<dyn OutboxRepository>,
    ) -> anyhow::Result<Self> {
        let http_dispatcher = Arc::new(HttpDispatcher::new(config.http_config.clone())?);
        let in_flight = Arc::new(AtomicU64::new(0));
        let metrics = Arc::new(RwLock::new(ProcessorMetrics::default()));

        let buffer_config = GlobalBufferConfig {
            max_size: config.global_buffer_size,
            batch_size: config.api_batch_size,
        };
        let buffer = Arc::new(GlobalBuffer::new(buffer_config));

        // Shared across every group processor: bounds how many groups may be
        // in their API-call critical section simultaneously.
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent_groups.max(1)));

        let processor_config = MessageGroupProcessorConfig {
            max_retries: config.max_retries as i32,
            batch_size: config.api_batch_size,
        };
        let distributor_config = GroupDistributorConfig {
            processor_config,
            max_groups: config.max_concurrent_groups * 10,
            group_idle_timeout_secs: 300,
        };
        let distributor = Arc::new(GroupDistributor::new(
            distributor_config,
            http_dispatcher,
            Arc::clone(&repository),
            semaphore,
            Arc::clone(&in_flight),
            Arc::clone(&metrics),
        ));

        let is_primary = Arc::new(AtomicBool::new(!config.leader_election.enabled));

        Ok(Self {
            config,
            repository,
            buffer,
            distributor,
            in_flight,
            is_primary,
            running: Arc::new(AtomicBool::new(false)),
            metrics,
        })
    }

    pub fn is_primary(&self) -> bool {
        self.is_primary.load(Ordering::SeqCst)
    }

    pub fn set_primary(&self, primary: bool) {
        self.is_primary.store(primary, Ordering::SeqCst);
        if primary {
            info!("Enhanced outbox processor became primary");
        } else {
            warn!("Enhanced outbox processor lost primary status");
        }
    }

    pub fn is_primary_flag(&self) -> Arc<AtomicBool> {
        self.is_primary.clone()
    }

    pub fn in_flight_count(&self) -> u64 {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub async fn metrics(&self) -> ProcessorMetrics {
        let mut metrics = self.metrics.read().await.clone();
        metrics.current_in_flight = self.in_flight_count();
        metrics.buffer_size = self.buffer.len().await;
        metrics.active_groups = self.distributor.stats().await.active_groups;
        metrics
    }

    pub async fn distributor_stats(&self) -> DistributorStats {
        self.distributor.stats().await
    }

    /// Start the processor without leader election (always primary).
    pub async fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("Processor already running");
            return;
        }

        info!(
            poll_interval_ms = %self.config.poll_interval.as_millis(),
            poll_batch_size = %self.config.poll_batch_size,
            max_in_flight = %self.config.max_in_flight,
            global_buffer_size = %self.config.global_buffer_size,
            max_concurrent_groups = %self.config.max_concurrent_groups,
            "Starting Enhanced Outbox Processor"
        );

        if self.is_primary() {
            self.run_startup_recovery().await;
        }

        let recovery_handle = self.spawn_periodic_recovery();
        let distributor_handle = self.spawn_distributor_loop();

        let mut poll_interval = tokio::time::interval(self.config.poll_interval);
        while self.running.load(Ordering::SeqCst) {
            poll_interval.tick().await;

            if !self.is_primary() {
                debug!("Skipping poll - not primary");
                continue;
            }

            if let Err(e) = self.poll_and_buffer().await {
                error!("Poll error: {}", e);
            }
        }

        info!("Shutting down enhanced outbox processor...");
        self.distributor.shutdown().await;
        recovery_handle.abort();
        distributor_handle.abort();
        info!("Enhanced outbox processor stopped");
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Start the processor with hot standby leader election. Only the
    /// leader instance polls and processes; standby instances idle until
    /// they become leader.
    #[cfg(feature = "standby")]
    pub async fn start_with_standby(self: Arc<Self>, leader_election: Arc<LeaderElection>) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("Processor already running");
            return;
        }

        info!(
            poll_interval_ms = %self.config.poll_interval.as_millis(),
            poll_batch_size = %self.config.poll_batch_size,
            max_in_flight = %self.config.max_in_flight,
            api_batch_size = %self.config.api_batch_size,
            "Starting Enhanced Outbox Processor with hot standby"
        );

        self.is_primary.store(leader_election.is_leader(), Ordering::SeqCst);
        if self.is_primary() {
            self.run_startup_recovery().await;
        }

        let leader_watcher_handle = {
            let this = Arc::clone(&self);
            let mut status_rx = leader_election.subscribe();
            let running = Arc::clone(&self.running);

            tokio::spawn(async move {
                while running.load(Ordering::SeqCst) {
                    match status_rx.changed().await {
                        Ok(()) => {
                            let status = *status_rx.borrow();
                            let is_leader = status == LeadershipStatus::Leader;
                            let was_leader = this.is_primary.swap(is_leader, Ordering::SeqCst);

                            if is_leader && !was_leader {
                                info!("Outbox processor became leader - starting active processing");
                                let this = Arc::clone(&this);
                                tokio::spawn(async move {
                                    this.run_startup_recovery().await;
                                });
                            } else if !is_leader && was_leader {
                                warn!("Outbox processor lost leadership - entering standby mode");
                            }
                        }
                        Err(_) => break,
                    }
                }
            })
        };

        let recovery_handle = self.spawn_periodic_recovery();
        let distributor_handle = self.spawn_distributor_loop();

        let mut poll_interval = tokio::time::interval(self.config.poll_interval);
        while self.running.load(Ordering::SeqCst) {
            poll_interval.tick().await;

            if !self.is_primary() {
                debug!("Skipping poll - not primary (standby mode)");
                continue;
            }

            if let Err(e) = self.poll_and_buffer().await {
                error!("Poll error: {}", e);
            }
        }

        info!("Shutting down enhanced outbox processor...");
        self.distributor.shutdown().await;
        recovery_handle.abort();
        distributor_handle.abort();
        leader_watcher_handle.abort();
        info!("Enhanced outbox processor stopped");
    }

    /// Startup once-off recovery (leader-only): every IN_PROGRESS item,
    /// regardless of age, is reset back to PENDING. A crashed predecessor
    /// leaves items stuck here with no other mechanism to reclaim them.
    async fn run_startup_recovery(&self) {
        for item_type in ITEM_TYPES {
            let timeout = Duration::from_secs(0);
            match self.repository.fetch_stuck_items(item_type, timeout, self.config.poll_batch_size).await {
                Ok(items) if !items.is_empty() => {
                    let count = items.len() as u64;
                    let ids: Vec<String> = items.into_iter().map(|i| i.id).collect();
                    if let Err(e) = self.repository.reset_stuck_items(item_type, ids).await {
                        error!(error = %e, ?item_type, "startup recovery: failed to reset stuck items");
                        continue;
                    }
                    info!(count, ?item_type, "startup recovery: reset stuck items to PENDING");
                }
                Ok(_) => {}
                Err(e) => error!(error = %e, ?item_type, "startup recovery: fetch failed"),
            }
        }
    }

    /// Periodic recoverable-item sweep (leader-only): items sitting in a
    /// non-terminal error status longer than `processing_timeout_seconds`
    /// are reset to PENDING for another attempt.
    fn spawn_periodic_recovery(&self) -> tokio::task::JoinHandle<()> {
        let repository = Arc::clone(&self.repository);
        let timeout = Duration::from_secs(self.config.processing_timeout_seconds);
        let interval = self.config.recovery_interval;
        let running = Arc::clone(&self.running);
        let in_flight = Arc::clone(&self.in_flight);
        let metrics = Arc::clone(&self.metrics);
        let is_primary = Arc::clone(&self.is_primary);
        let limit = self.config.poll_batch_size;

        tokio::spawn(async move {
            let mut interval_timer = tokio::time::interval(interval);
            while running.load(Ordering::SeqCst) {
                interval_timer.tick().await;

                if !is_primary.load(Ordering::SeqCst) {
                    continue;
                }

                for item_type in ITEM_TYPES {
                    match repository.fetch_recoverable_items(item_type, timeout, limit).await {
                        Ok(items) if !items.is_empty() => {
                            let count = items.len() as u64;
                            let ids: Vec<String> = items.into_iter().map(|i| i.id).collect();
                            if let Err(e) = repository.reset_recoverable_items(item_type, ids).await {
                                error!(error = %e, ?item_type, "periodic recovery: failed to reset items");
                                continue;
                            }
                            in_flight.fetch_sub(count, Ordering::SeqCst);
                            let mut m = metrics.write().await;
                            m.items_recovered += count;
                            info!(count, ?item_type, "periodic recovery: reset recoverable items to PENDING");
                        }
                        Ok(_) => {}
                        Err(e) => error!(error = %e, ?item_type, "periodic recovery: fetch failed"),
                    }
                }
            }
        })
    }

    /// Drains the global buffer and hands items to the group distributor.
    /// Status write-back happens inside the per-group processors themselves
    /// once their API call actually completes, not here.
    fn spawn_distributor_loop(&self) -> tokio::task::JoinHandle<()> {
        let buffer = Arc::clone(&self.buffer);
        let distributor = Arc::clone(&self.distributor);
        let running = Arc::clone(&self.running);

        tokio::spawn(async move {
            while running.load(Ordering::SeqCst) {
                let batch = buffer.drain_batch().await;
                if batch.is_empty() {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    continue;
                }

                for item in batch {
                    distributor.distribute(item).await;
                }
            }
        })
    }

    /// One poll tick: for each item type, fetch up to the available
    /// in-flight budget worth of PENDING items, mark them IN_PROGRESS, and
    /// push them into the global buffer.
    async fn poll_and_buffer(&self) -> anyhow::Result<()> {
        for item_type in ITEM_TYPES {
            let current_in_flight = self.in_flight.load(Ordering::SeqCst) as i64;
            let remaining = self.config.max_in_flight as i64 - current_in_flight;
            if remaining <= 0 {
                debug!(?item_type, current_in_flight, "skipping poll - at in-flight capacity");
                continue;
            }

            let limit = (self.config.poll_batch_size as i64).min(remaining) as u32;
            let items = self.repository.fetch_pending_by_type(item_type, limit).await?;
            if items.is_empty() {
                continue;
            }

            debug!(?item_type, count = items.len(), "polled pending items");

            let ids: Vec<String> = items.iter().map(|i| i.id.clone()).collect();
            self.repository.mark_in_progress(item_type, ids).await?;
            self.in_flight.fetch_add(items.len() as u64, Ordering::SeqCst);

            {
                let mut m = self.metrics.write().await;
                m.items_polled += items.len() as u64;
            }

            let mut rejected_ids = Vec::new();
            for item in items {
                let id = item.id.clone();
                if self.buffer.push(item).await.is_err() {
                    rejected_ids.push(id);
                }
            }

            if !rejected_ids.is_empty() {
                let rejected_count = rejected_ids.len() as u64;
                warn!(count = rejected_count, ?item_type, "buffer rejected items, resetting to PENDING");
                self.in_flight.fetch_sub(rejected_count, Ordering::SeqCst);
                if let Err(e) = self.repository.reset_stuck_items(item_type, rejected_ids).await {
                    error!(error = %e, ?item_type, "failed to reset buffer-rejected items");
                }
            }
        }

        Ok(())
    }
}
