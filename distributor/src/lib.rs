//! Airdrop Distributor Library
//!
//! Turns completed airdrop tasks into on-chain merkle roots. Each cycle
//! encodes every participant of every active task as a leaf, builds one
//! sorted-pair Keccak-256 tree per task, stores one proof per participant and
//! publishes all roots to the registry contract in a single transaction.

use std::sync::Arc;

use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use airdrop_common::AirdropResult;

pub mod abi;
pub mod aggregator;
pub mod chain;
pub mod config;
pub mod leaf;
pub mod merkle;
pub mod metrics;
pub mod proof;
pub mod publisher;
pub mod storage;

use aggregator::{AggregatorOptions, CycleReport, TaskAggregator};
use chain::{ChainClient, Web3ChainClient};
use config::DistributorConfig;
use metrics::DistributorMetrics;
use publisher::RootPublisher;
use storage::Storage;

/// Scheduled distribution service
pub struct AirdropDistributor {
    config: Arc<DistributorConfig>,
    aggregator: Arc<TaskAggregator>,
    metrics: Arc<DistributorMetrics>,
    /// Held for the duration of a cycle; a trigger that cannot take it is dropped
    cycle_guard: Arc<Mutex<()>>,
    shutdown: watch::Sender<bool>,
    is_running: Arc<RwLock<bool>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl AirdropDistributor {
    /// Connect the configured store and chain endpoint
    pub async fn new(config: DistributorConfig) -> AirdropResult<Self> {
        config.validate()?;

        let storage = storage::connect(&config.database).await?;
        let client: Arc<dyn ChainClient> = Arc::new(Web3ChainClient::new(&config.chain.rpc_url)?);
        let publisher = RootPublisher::from_config(&config, client)?;

        Self::with_components(config, storage, publisher)
    }

    /// Assemble the service from already built parts
    pub fn with_components(
        config: DistributorConfig,
        storage: Arc<dyn Storage>,
        publisher: RootPublisher,
    ) -> AirdropResult<Self> {
        let metrics = Arc::new(DistributorMetrics::new()?);
        let (shutdown, shutdown_rx) = watch::channel(false);

        let options = AggregatorOptions {
            max_concurrent_tasks: config.schedule.max_concurrent_tasks,
            skip_unchanged: config.schedule.skip_unchanged,
            sync_rewards: config.chain.sync_rewards,
        };
        let aggregator = TaskAggregator::new(storage, Arc::new(publisher), metrics.clone(), options, shutdown_rx);

        Ok(Self {
            config: Arc::new(config),
            aggregator: Arc::new(aggregator),
            metrics,
            cycle_guard: Arc::new(Mutex::new(())),
            shutdown,
            is_running: Arc::new(RwLock::new(false)),
            worker: Mutex::new(None),
        })
    }

    /// Run a cycle now. Returns `Ok(None)` when another cycle is in flight.
    pub async fn trigger_cycle(&self) -> AirdropResult<Option<CycleReport>> {
        run_guarded(&self.aggregator, &self.cycle_guard, &self.metrics, self.config.monitoring.enable_metrics).await
    }

    /// Start the interval loop in the background
    pub async fn start(&self) -> AirdropResult<()> {
        let mut running = self.is_running.write().await;
        if *running {
            warn!("Airdrop distributor is already running");
            return Ok(());
        }

        info!(
            interval_secs = self.config.schedule.cycle_interval_secs,
            "Starting airdrop distributor"
        );
        self.shutdown.send_replace(false);

        let aggregator = self.aggregator.clone();
        let guard = self.cycle_guard.clone();
        let metrics = self.metrics.clone();
        let config = self.config.clone();
        let mut shutdown_rx = self.shutdown.subscribe();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(config.cycle_interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            if !config.service.run_on_start {
                // the first tick completes immediately
                ticker.tick().await;
            }

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match run_guarded(&aggregator, &guard, &metrics, config.monitoring.enable_metrics).await {
                            Ok(Some(report)) => info!(
                                tasks = report.results.len(),
                                published = report.publication.is_published(),
                                "Scheduled cycle complete"
                            ),
                            Ok(None) => {}
                            Err(e) => error!(error = %e, retryable = e.is_retryable(), "Scheduled cycle failed"),
                        }
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("Distribution loop exited");
        });

        *self.worker.lock().await = Some(handle);
        *running = true;
        info!("Airdrop distributor started");
        Ok(())
    }

    /// Stop the loop. An in-flight cycle finishes its writes and skips publication.
    pub async fn stop(&self) -> AirdropResult<()> {
        let mut running = self.is_running.write().await;
        if !*running {
            warn!("Airdrop distributor is not running");
            return Ok(());
        }

        info!("Stopping airdrop distributor");
        self.shutdown.send_replace(true);

        if let Some(handle) = self.worker.lock().await.take() {
            if let Err(e) = handle.await {
                error!("Distribution loop terminated abnormally: {}", e);
            }
        }

        *running = false;
        info!("Airdrop distributor stopped");
        Ok(())
    }

    pub async fn is_running(&self) -> bool {
        *self.is_running.read().await
    }

    pub fn metrics(&self) -> &DistributorMetrics {
        &self.metrics
    }

    pub fn config(&self) -> &DistributorConfig {
        &self.config
    }
}

async fn run_guarded(
    aggregator: &TaskAggregator,
    guard: &Mutex<()>,
    metrics: &DistributorMetrics,
    log_metrics: bool,
) -> AirdropResult<Option<CycleReport>> {
    let _cycle = match guard.try_lock() {
        Ok(permit) => permit,
        Err(_) => {
            metrics.cycles_skipped.inc();
            warn!("Distribution cycle already running, skipping trigger");
            return Ok(None);
        }
    };

    let report = aggregator.run_cycle().await?;

    if log_metrics {
        match metrics.render() {
            Ok(text) => debug!("Distributor metrics:\n{}", text),
            Err(e) => warn!(error = %e, "Failed to render metrics"),
        }
    }

    Ok(Some(report))
}
