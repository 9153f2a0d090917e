use serde::{Deserialize, Serialize};
use chrono::{DateTime, Utc};
use ethereum_types::U256;
use std::fmt;
use std::str::FromStr;

use crate::error::{RecordError, SerializationError};

/// 32-byte digest used for tree nodes and roots
pub type Hash32 = [u8; 32];

/// Identifier of a reward-bearing task, encoded on-chain as `uint256`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(pub u64);

impl TaskId {
    pub fn as_u256(&self) -> U256 {
        U256::from(self.0)
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for TaskId {
    fn from(id: u64) -> Self {
        TaskId(id)
    }
}

/// Campaign status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Active,
    Completed,
    Expired,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Active => "active",
            TaskStatus::Completed => "completed",
            TaskStatus::Expired => "expired",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = SerializationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "active" => Ok(TaskStatus::Active),
            "completed" => Ok(TaskStatus::Completed),
            "expired" => Ok(TaskStatus::Expired),
            other => Err(SerializationError::InvalidFormat(format!("unknown task status '{}'", other))),
        }
    }
}

/// A reward-bearing airdrop task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub name: String,
    pub description: String,
    /// Per-participant reward in the token's smallest unit. Identical for all
    /// participants and embedded into every leaf of the task's tree.
    pub reward_amount: U256,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn new(id: TaskId, name: impl Into<String>, reward_amount: U256) -> Self {
        let now = Utc::now();
        Self {
            id,
            name: name.into(),
            description: String::new(),
            reward_amount,
            status: TaskStatus::Active,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == TaskStatus::Active
    }
}

/// Participation status of one user in one task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserTaskStatus {
    Claimed,
    Completed,
    Rewarded,
    Failed,
}

impl UserTaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserTaskStatus::Claimed => "claimed",
            UserTaskStatus::Completed => "completed",
            UserTaskStatus::Rewarded => "rewarded",
            UserTaskStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for UserTaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UserTaskStatus {
    type Err = SerializationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "claimed" => Ok(UserTaskStatus::Claimed),
            "completed" => Ok(UserTaskStatus::Completed),
            "rewarded" => Ok(UserTaskStatus::Rewarded),
            "failed" => Ok(UserTaskStatus::Failed),
            other => Err(SerializationError::InvalidFormat(format!("unknown user task status '{}'", other))),
        }
    }
}

/// Key of a user task record: `(address, task_id)`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserTaskKey {
    pub address: String,
    pub task_id: TaskId,
}

impl fmt::Display for UserTaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.address, self.task_id)
    }
}

/// One user's participation in one task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserTaskRecord {
    pub id: Option<i64>,
    pub user_id: String,
    pub task_id: TaskId,
    /// Account address as stored; validated when the leaf is encoded
    pub address: String,
    pub status: UserTaskStatus,
    /// JSON array of `0x`-prefixed sibling hashes, empty until computed
    pub proof: String,
    pub claimed_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub rewarded_at: Option<DateTime<Utc>>,
    pub tx_hash: Option<String>,
}

impl UserTaskRecord {
    /// Create a freshly claimed record
    pub fn claim(user_id: impl Into<String>, address: impl Into<String>, task_id: TaskId) -> Self {
        Self {
            id: None,
            user_id: user_id.into(),
            task_id,
            address: address.into(),
            status: UserTaskStatus::Claimed,
            proof: String::new(),
            claimed_at: Utc::now(),
            completed_at: None,
            rewarded_at: None,
            tx_hash: None,
        }
    }

    pub fn key(&self) -> UserTaskKey {
        UserTaskKey {
            address: self.address.clone(),
            task_id: self.task_id,
        }
    }

    pub fn has_proof(&self) -> bool {
        !self.proof.is_empty()
    }

    /// Failed is the only status that allows the user to claim the task again
    pub fn can_reclaim(&self) -> bool {
        self.status == UserTaskStatus::Failed
    }

    pub fn complete(&mut self) -> Result<(), RecordError> {
        self.transition(UserTaskStatus::Claimed, UserTaskStatus::Completed)?;
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    pub fn fail(&mut self) -> Result<(), RecordError> {
        match self.status {
            UserTaskStatus::Claimed | UserTaskStatus::Completed => {
                self.status = UserTaskStatus::Failed;
                Ok(())
            }
            from => Err(RecordError::InvalidTransition { from, to: UserTaskStatus::Failed }),
        }
    }

    pub fn reclaim(&mut self) -> Result<(), RecordError> {
        self.transition(UserTaskStatus::Failed, UserTaskStatus::Claimed)?;
        self.claimed_at = Utc::now();
        self.completed_at = None;
        Ok(())
    }

    /// Record a confirmed on-chain claim
    pub fn mark_rewarded(&mut self, tx_hash: impl Into<String>) -> Result<(), RecordError> {
        if !self.has_proof() {
            return Err(RecordError::MissingProof(self.task_id));
        }
        self.transition(UserTaskStatus::Completed, UserTaskStatus::Rewarded)?;
        self.rewarded_at = Some(Utc::now());
        self.tx_hash = Some(tx_hash.into());
        Ok(())
    }

    pub fn attach_proof(&mut self, proof_json: String) {
        self.proof = proof_json;
    }

    fn transition(&mut self, expected: UserTaskStatus, to: UserTaskStatus) -> Result<(), RecordError> {
        if self.status != expected {
            return Err(RecordError::InvalidTransition { from: self.status, to });
        }
        self.status = to;
        Ok(())
    }
}

/// `(task_id, root)` pair submitted to the on-chain registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootPair {
    pub task_id: TaskId,
    pub root: Hash32,
}

impl RootPair {
    pub fn new(task_id: TaskId, root: Hash32) -> Self {
        Self { task_id, root }
    }
}
