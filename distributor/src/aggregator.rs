//! Per-cycle aggregation of completed user tasks into published merkle roots.
//!
//! Every cycle recomputes each active task from scratch: records are encoded
//! into leaves, a tree is built, one proof per record is written back to the
//! store, and all roots go out in a single transaction. Tasks are processed
//! concurrently and fail independently of each other.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use ethereum_types::{H256, U256};
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use serde::{Serialize, Serializer};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use airdrop_common::{
    keccak256, to_hex_prefixed, AirdropResult, Hash32, HashFunction, Keccak256Hasher, RootPair, Task, TaskId,
    UserTaskRecord,
};

use crate::leaf;
use crate::merkle::MerkleTree;
use crate::metrics::DistributorMetrics;
use crate::proof::prove_leaf;
use crate::publisher::RootPublisher;
use crate::storage::{Storage, TaskStore, UserTaskStore};

fn serialize_hash<S: Serializer>(hash: &Hash32, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&to_hex_prefixed(hash))
}

/// What happened to one task during a cycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TaskOutcome {
    /// Tree built and proofs written
    Built {
        #[serde(serialize_with = "serialize_hash")]
        root: Hash32,
        leaf_count: usize,
        proofs_written: usize,
        rejected_records: usize,
        failed_writes: usize,
    },
    /// Leaves identical to the last published tree; nothing rebuilt or written
    Unchanged {
        #[serde(serialize_with = "serialize_hash")]
        root: Hash32,
    },
    /// Task left out of this cycle's publication
    Skipped { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PerTaskResult {
    pub task_id: TaskId,
    #[serde(flatten)]
    pub outcome: TaskOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PublicationOutcome {
    Published { tx_hash: H256, tasks: Vec<TaskId> },
    Failed { reason: String },
    Skipped { reason: String },
}

impl PublicationOutcome {
    pub fn is_published(&self) -> bool {
        matches!(self, PublicationOutcome::Published { .. })
    }
}

/// Summary of one distribution cycle
#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    /// Ordered by task id
    pub results: Vec<PerTaskResult>,
    pub publication: PublicationOutcome,
    /// `setReward` submission, when reward syncing is enabled
    pub reward_sync: Option<PublicationOutcome>,
    /// Shutdown was requested while the cycle ran
    pub cancelled: bool,
}

impl CycleReport {
    /// Roots of the tasks built this cycle, in task id order
    pub fn built_roots(&self) -> Vec<RootPair> {
        self.results
            .iter()
            .filter_map(|r| match r.outcome {
                TaskOutcome::Built { root, .. } => Some(RootPair::new(r.task_id, root)),
                _ => None,
            })
            .collect()
    }

    pub fn result_for(&self, task_id: TaskId) -> Option<&TaskOutcome> {
        self.results.iter().find(|r| r.task_id == task_id).map(|r| &r.outcome)
    }
}

/// Knobs taken from the `schedule` and `chain` sections
#[derive(Debug, Clone)]
pub struct AggregatorOptions {
    pub max_concurrent_tasks: usize,
    pub skip_unchanged: bool,
    pub sync_rewards: bool,
}

impl Default for AggregatorOptions {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 4,
            skip_unchanged: false,
            sync_rewards: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Fingerprint {
    leaves: Hash32,
    root: Hash32,
}

/// Root awaiting publication
struct BuiltTask {
    pair: RootPair,
    reward: U256,
    fingerprint: Hash32,
}

pub struct TaskAggregator {
    storage: Arc<dyn Storage>,
    publisher: Arc<RootPublisher>,
    hasher: Arc<dyn HashFunction>,
    metrics: Arc<DistributorMetrics>,
    options: AggregatorOptions,
    shutdown: watch::Receiver<bool>,
    /// Last published leaf set per task
    published: Mutex<HashMap<TaskId, Fingerprint>>,
}

impl TaskAggregator {
    pub fn new(
        storage: Arc<dyn Storage>,
        publisher: Arc<RootPublisher>,
        metrics: Arc<DistributorMetrics>,
        options: AggregatorOptions,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            storage,
            publisher,
            hasher: Arc::new(Keccak256Hasher),
            metrics,
            options,
            shutdown,
            published: Mutex::new(HashMap::new()),
        }
    }

    /// Replace the tree hash function; only Keccak-256 matches the contract
    pub fn with_hasher(mut self, hasher: Arc<dyn HashFunction>) -> Self {
        self.hasher = hasher;
        self
    }

    fn shutdown_requested(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Run one full cycle: build every active task, write proofs, publish roots
    pub async fn run_cycle(&self) -> AirdropResult<CycleReport> {
        let started_at = Utc::now();
        let timer = Instant::now();
        self.metrics.cycles_run.inc();

        let tasks = self.storage.list_active().await?;
        let task_ids: Vec<TaskId> = tasks.iter().map(|t| t.id).collect();
        self.published.lock().retain(|id, _| task_ids.contains(id));
        let records = self.storage.list_by_task_ids(&task_ids).await?;
        info!(tasks = tasks.len(), records = records.len(), "Starting distribution cycle");

        let mut grouped: HashMap<TaskId, Vec<UserTaskRecord>> = HashMap::new();
        for record in records {
            grouped.entry(record.task_id).or_default().push(record);
        }

        let work: Vec<(Task, Vec<UserTaskRecord>)> = tasks
            .into_iter()
            .map(|task| {
                let records = grouped.remove(&task.id).unwrap_or_default();
                (task, records)
            })
            .collect();

        let mut processed: Vec<(PerTaskResult, Option<BuiltTask>)> = stream::iter(work)
            .map(|(task, records)| self.process_task(task, records))
            .buffer_unordered(self.options.max_concurrent_tasks.max(1))
            .collect()
            .await;
        processed.sort_by_key(|(result, _)| result.task_id);

        let cancelled = self.shutdown_requested();
        let mut results = Vec::with_capacity(processed.len());
        let mut built = Vec::new();
        for (result, pending) in processed {
            results.push(result);
            built.extend(pending);
        }

        let (publication, reward_sync) = if cancelled {
            warn!("Shutdown requested, not publishing this cycle's roots");
            (PublicationOutcome::Skipped { reason: "shutdown requested".to_string() }, None)
        } else {
            self.publish(&built).await
        };

        let elapsed = timer.elapsed();
        self.metrics.last_cycle_seconds.set(elapsed.as_secs_f64());
        info!(
            duration_ms = elapsed.as_millis() as u64,
            built = built.len(),
            published = publication.is_published(),
            "Distribution cycle finished"
        );

        Ok(CycleReport {
            started_at,
            duration_ms: elapsed.as_millis() as u64,
            results,
            publication,
            reward_sync,
            cancelled,
        })
    }

    async fn publish(&self, built: &[BuiltTask]) -> (PublicationOutcome, Option<PublicationOutcome>) {
        if built.is_empty() {
            debug!("No task roots to publish");
            return (PublicationOutcome::Skipped { reason: "no task roots".to_string() }, None);
        }

        let pairs: Vec<RootPair> = built.iter().map(|b| b.pair).collect();
        let task_ids: Vec<TaskId> = pairs.iter().map(|p| p.task_id).collect();

        let publication = match self.publisher.publish(&pairs).await {
            Ok(tx_hash) => {
                self.metrics.publish_succeeded.inc();
                let mut published = self.published.lock();
                for task in built {
                    published.insert(
                        task.pair.task_id,
                        Fingerprint { leaves: task.fingerprint, root: task.pair.root },
                    );
                }
                PublicationOutcome::Published { tx_hash, tasks: task_ids }
            }
            Err(e) => {
                // proofs stay persisted; the next cycle recomputes and republishes
                self.metrics.publish_failed.inc();
                error!(error = %e, tasks = pairs.len(), "Failed to publish merkle roots");
                return (PublicationOutcome::Failed { reason: e.to_string() }, None);
            }
        };

        if !self.options.sync_rewards {
            return (publication, None);
        }

        let rewards: Vec<(TaskId, U256)> = built.iter().map(|b| (b.pair.task_id, b.reward)).collect();
        let reward_sync = match self.publisher.publish_rewards(&rewards).await {
            Ok(tx_hash) => PublicationOutcome::Published {
                tx_hash,
                tasks: rewards.iter().map(|(id, _)| *id).collect(),
            },
            Err(e) => {
                warn!(error = %e, "Failed to sync task rewards");
                PublicationOutcome::Failed { reason: e.to_string() }
            }
        };

        (publication, Some(reward_sync))
    }

    /// Build, prove and persist one task. Failures are reported, never propagated.
    async fn process_task(&self, task: Task, mut records: Vec<UserTaskRecord>) -> (PerTaskResult, Option<BuiltTask>) {
        let task_id = task.id;
        let skipped = |reason: String| {
            (PerTaskResult { task_id, outcome: TaskOutcome::Skipped { reason } }, None)
        };

        if self.shutdown_requested() {
            return skipped("shutdown requested".to_string());
        }
        let mut accepted = Vec::with_capacity(records.len());
        let mut leaves = Vec::with_capacity(records.len());
        let mut rejected_records = 0;
        for record in records.drain(..) {
            match leaf::encode_record(&record, &task) {
                Ok(bytes) => {
                    leaves.push(bytes);
                    accepted.push(record);
                }
                Err(e) => {
                    warn!(task_id = %task_id, key = %record.key(), error = %e, "Rejecting record");
                    self.metrics.records_rejected.inc();
                    rejected_records += 1;
                }
            }
        }

        let fingerprint = self.fingerprint(&leaves);
        if self.options.skip_unchanged && accepted.iter().all(|r| r.has_proof()) {
            if let Some(previous) = self.published.lock().get(&task_id).copied() {
                if previous.leaves == fingerprint {
                    debug!(task_id = %task_id, "Leaves unchanged since last publication");
                    return (
                        PerTaskResult { task_id, outcome: TaskOutcome::Unchanged { root: previous.root } },
                        None,
                    );
                }
            }
        }

        let tree = match MerkleTree::build(&leaves, self.hasher.clone()) {
            Ok(tree) => tree,
            Err(e) => {
                warn!(task_id = %task_id, error = %e, "Failed to build task tree");
                self.metrics.tasks_failed.inc();
                return skipped(e.to_string());
            }
        };

        for (record, leaf_bytes) in accepted.iter_mut().zip(&leaves) {
            match prove_leaf(&tree, leaf_bytes) {
                Ok(proof) => record.attach_proof(proof.to_json()),
                Err(e) => {
                    error!(task_id = %task_id, key = %record.key(), error = %e, "Proof extraction failed");
                    self.metrics.tasks_failed.inc();
                    return skipped(e.to_string());
                }
            }
        }

        let report = match self.storage.bulk_update_proof(&accepted).await {
            Ok(report) => report,
            Err(e) => {
                error!(task_id = %task_id, error = %e, "Failed to write proofs");
                self.metrics.tasks_failed.inc();
                return skipped(e.to_string());
            }
        };
        if !report.is_complete() {
            warn!(task_id = %task_id, failed = report.failed.len(), "Some proofs were not written");
        }

        self.metrics.tasks_processed.inc();
        self.metrics.proofs_written.inc_by(report.updated as u64);
        info!(
            task_id = %task_id,
            leaves = tree.leaf_count(),
            root = %tree.root_hex(),
            "Built task tree"
        );

        let root = tree.root();
        (
            PerTaskResult {
                task_id,
                outcome: TaskOutcome::Built {
                    root,
                    leaf_count: tree.leaf_count(),
                    proofs_written: report.updated,
                    rejected_records,
                    failed_writes: report.failed.len(),
                },
            },
            Some(BuiltTask {
                pair: RootPair::new(task_id, root),
                reward: task.reward_amount,
                fingerprint,
            }),
        )
    }

    /// Order-free digest of a task's leaf set
    fn fingerprint(&self, leaves: &[Vec<u8>]) -> Hash32 {
        let mut hashes: Vec<Hash32> = leaves.iter().map(|l| self.hasher.hash(l)).collect();
        hashes.sort_unstable();
        keccak256(&hashes.concat())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::AbiPacker;
    use crate::chain::MockChainClient;
    use crate::proof::MerkleProof;
    use crate::publisher::PublisherSettings;
    use crate::storage::MemoryStorage;
    use airdrop_common::{ChainError, MerkleError, TaskStatus};
    use web3::signing::SecretKey;
    use web3::types::{Address, SignedTransaction};

    const ADDR_A: &str = "0x4ffDe62cE898639329850eC872A5535F64cb8181";
    const ADDR_B: &str = "0x1111111111111111111111111111111111111111";

    fn mock_chain(send: impl Fn() -> Result<H256, ChainError> + Send + 'static) -> MockChainClient {
        let mut mock = MockChainClient::new();
        mock.expect_pending_nonce().returning(|_| Ok(U256::zero()));
        mock.expect_suggest_gas_price().returning(|| Ok(U256::one()));
        mock.expect_estimate_gas().returning(|_| Ok(U256::from(80_000u64)));
        mock.expect_sign_transaction().returning(|tx, _| {
            Ok(SignedTransaction {
                message_hash: H256::zero(),
                v: 0,
                r: H256::zero(),
                s: H256::zero(),
                raw_transaction: tx.data,
                transaction_hash: H256::zero(),
            })
        });
        mock.expect_send_raw_transaction().returning(move |_| send());
        mock
    }

    fn aggregator(
        storage: Arc<MemoryStorage>,
        chain: MockChainClient,
        options: AggregatorOptions,
    ) -> (TaskAggregator, watch::Sender<bool>) {
        let publisher = RootPublisher::new(
            Arc::new(chain),
            AbiPacker::from_json(include_str!("../abi/Airdrop.json")).unwrap(),
            Address::repeat_byte(0xcc),
            SecretKey::from_slice(&[0x22u8; 32]).unwrap(),
            PublisherSettings { chain_id: Some(1), ..Default::default() },
        );
        let (tx, rx) = watch::channel(false);
        let aggregator = TaskAggregator::new(
            storage,
            Arc::new(publisher),
            Arc::new(DistributorMetrics::new().unwrap()),
            options,
            rx,
        );
        (aggregator, tx)
    }

    async fn seed(storage: &MemoryStorage) {
        storage.upsert_task(&Task::new(TaskId(1), "follow", U256::from(100u64))).await.unwrap();
        storage.upsert_task(&Task::new(TaskId(2), "retweet", U256::from(25u64))).await.unwrap();
        storage.claim_task("u1", ADDR_A, TaskId(1)).await.unwrap();
        storage.claim_task("u2", ADDR_B, TaskId(1)).await.unwrap();
        storage.claim_task("u1", ADDR_A, TaskId(2)).await.unwrap();
    }

    #[tokio::test]
    async fn test_cycle_builds_and_publishes_every_task() {
        let storage = Arc::new(MemoryStorage::new());
        seed(&storage).await;
        let (aggregator, _tx) =
            aggregator(storage.clone(), mock_chain(|| Ok(H256::repeat_byte(0x01))), AggregatorOptions::default());

        let report = aggregator.run_cycle().await.unwrap();
        assert_eq!(report.built_roots().len(), 2);
        assert_eq!(
            report.publication,
            PublicationOutcome::Published { tx_hash: H256::repeat_byte(0x01), tasks: vec![TaskId(1), TaskId(2)] }
        );

        // every stored proof verifies against its task's published root
        let task = storage.get_task(TaskId(1)).await.unwrap().unwrap();
        let root = report.built_roots()[0].root;
        for address in [ADDR_A, ADDR_B] {
            let record = storage.get_user_task(address, TaskId(1)).await.unwrap().unwrap();
            let proof = MerkleProof::from_json(&record.proof).unwrap();
            let leaf = leaf::encode_record(&record, &task).unwrap();
            assert!(proof.verify(&leaf, &root, &Keccak256Hasher));
        }
    }

    #[tokio::test]
    async fn test_bad_address_rejected_but_task_built() {
        let storage = Arc::new(MemoryStorage::new());
        seed(&storage).await;
        storage.insert_user_task(UserTaskRecord::claim("u3", "0xnot-an-address", TaskId(1)));
        let (aggregator, _tx) = aggregator(storage.clone(), mock_chain(|| Ok(H256::zero())), AggregatorOptions::default());

        let report = aggregator.run_cycle().await.unwrap();
        match report.result_for(TaskId(1)) {
            Some(TaskOutcome::Built { leaf_count, rejected_records, proofs_written, .. }) => {
                assert_eq!(*leaf_count, 2);
                assert_eq!(*rejected_records, 1);
                assert_eq!(*proofs_written, 2);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        let records = storage.list_by_task_ids(&[TaskId(1)]).await.unwrap();
        let broken = records.iter().find(|r| r.user_id == "u3").unwrap();
        assert!(!broken.has_proof());
    }

    #[tokio::test]
    async fn test_task_with_only_bad_records_is_skipped() {
        let storage = Arc::new(MemoryStorage::new());
        seed(&storage).await;
        storage.upsert_task(&Task::new(TaskId(3), "quiz", U256::from(5u64))).await.unwrap();
        storage.insert_user_task(UserTaskRecord::claim("u4", "garbage", TaskId(3)));
        let (aggregator, _tx) = aggregator(storage, mock_chain(|| Ok(H256::zero())), AggregatorOptions::default());

        let report = aggregator.run_cycle().await.unwrap();
        assert!(matches!(report.result_for(TaskId(3)), Some(TaskOutcome::Skipped { .. })));
        assert_eq!(report.built_roots().len(), 2);
    }

    #[tokio::test]
    async fn test_task_without_records_reports_empty_input() {
        let storage = Arc::new(MemoryStorage::new());
        seed(&storage).await;
        storage.upsert_task(&Task::new(TaskId(3), "quiz", U256::from(5u64))).await.unwrap();
        let (aggregator, _tx) = aggregator(storage, mock_chain(|| Ok(H256::zero())), AggregatorOptions::default());

        let report = aggregator.run_cycle().await.unwrap();
        assert_eq!(
            report.result_for(TaskId(3)),
            Some(&TaskOutcome::Skipped { reason: MerkleError::EmptyInput.to_string() })
        );
        assert_eq!(aggregator.metrics.tasks_failed.get(), 1);
        assert_eq!(report.built_roots().len(), 2);
    }

    #[tokio::test]
    async fn test_publish_failure_keeps_proofs() {
        let storage = Arc::new(MemoryStorage::new());
        seed(&storage).await;
        let (aggregator, _tx) = aggregator(
            storage.clone(),
            mock_chain(|| Err(ChainError::Submission("replacement underpriced".to_string()))),
            AggregatorOptions::default(),
        );

        let report = aggregator.run_cycle().await.unwrap();
        assert!(matches!(report.publication, PublicationOutcome::Failed { .. }));
        let record = storage.get_user_task(ADDR_A, TaskId(1)).await.unwrap().unwrap();
        assert!(record.has_proof());
    }

    #[tokio::test]
    async fn test_skip_unchanged_after_publish() {
        let storage = Arc::new(MemoryStorage::new());
        seed(&storage).await;
        let options = AggregatorOptions { skip_unchanged: true, ..Default::default() };
        let (aggregator, _tx) = aggregator(storage.clone(), mock_chain(|| Ok(H256::zero())), options);

        let first = aggregator.run_cycle().await.unwrap();
        let roots = first.built_roots();
        assert_eq!(roots.len(), 2);

        let second = aggregator.run_cycle().await.unwrap();
        assert_eq!(second.result_for(TaskId(1)), Some(&TaskOutcome::Unchanged { root: roots[0].root }));
        assert!(matches!(second.publication, PublicationOutcome::Skipped { .. }));

        // a new participant changes the leaf set
        storage.claim_task("u9", "0x2222222222222222222222222222222222222222", TaskId(2)).await.unwrap();
        let third = aggregator.run_cycle().await.unwrap();
        assert!(matches!(third.result_for(TaskId(2)), Some(TaskOutcome::Built { .. })));
        assert!(matches!(third.result_for(TaskId(1)), Some(TaskOutcome::Unchanged { .. })));
    }

    #[tokio::test]
    async fn test_expired_task_fingerprint_is_dropped() {
        let storage = Arc::new(MemoryStorage::new());
        seed(&storage).await;
        let options = AggregatorOptions { skip_unchanged: true, ..Default::default() };
        let (aggregator, _tx) = aggregator(storage.clone(), mock_chain(|| Ok(H256::zero())), options);

        aggregator.run_cycle().await.unwrap();
        assert_eq!(aggregator.published.lock().len(), 2);

        let mut expired = storage.get_task(TaskId(2)).await.unwrap().unwrap();
        expired.status = TaskStatus::Expired;
        storage.upsert_task(&expired).await.unwrap();

        aggregator.run_cycle().await.unwrap();
        let published = aggregator.published.lock();
        assert!(published.contains_key(&TaskId(1)));
        assert!(!published.contains_key(&TaskId(2)));
    }

    #[tokio::test]
    async fn test_shutdown_stops_new_trees() {
        let storage = Arc::new(MemoryStorage::new());
        seed(&storage).await;
        let mut chain = MockChainClient::new();
        chain.expect_send_raw_transaction().never();
        let (aggregator, tx) = aggregator(storage, chain, AggregatorOptions::default());

        tx.send(true).unwrap();
        let report = aggregator.run_cycle().await.unwrap();
        assert!(report.cancelled);
        assert!(report.built_roots().is_empty());
        assert!(matches!(report.publication, PublicationOutcome::Skipped { .. }));
    }

    #[tokio::test]
    async fn test_reward_sync() {
        let storage = Arc::new(MemoryStorage::new());
        seed(&storage).await;
        let options = AggregatorOptions { sync_rewards: true, ..Default::default() };
        let (aggregator, _tx) = aggregator(storage, mock_chain(|| Ok(H256::repeat_byte(0x05))), options);

        let report = aggregator.run_cycle().await.unwrap();
        assert!(report.publication.is_published());
        assert!(matches!(report.reward_sync, Some(PublicationOutcome::Published { .. })));
    }

    #[test]
    fn test_report_serializes_hex_roots() {
        let report = CycleReport {
            started_at: Utc::now(),
            duration_ms: 3,
            results: vec![PerTaskResult {
                task_id: TaskId(1),
                outcome: TaskOutcome::Unchanged { root: [0xab; 32] },
            }],
            publication: PublicationOutcome::Skipped { reason: "no task roots".to_string() },
            reward_sync: None,
            cancelled: false,
        };
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["results"][0]["outcome"], "unchanged");
        assert_eq!(json["results"][0]["root"], format!("0x{}", "ab".repeat(32)));
        assert_eq!(json["publication"]["status"], "skipped");
    }
}
