use thiserror::Error;
use crate::types::{TaskId, UserTaskStatus};

/// Main error type for the airdrop distribution pipeline
#[derive(Error, Debug)]
pub enum AirdropError {
    #[error("Merkle error: {0}")]
    Merkle(#[from] MerkleError),

    #[error("Encoding error: {0}")]
    Encoding(#[from] EncodingError),

    #[error("Chain error: {0}")]
    Chain(#[from] ChainError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Record error: {0}")]
    Record(#[from] RecordError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] SerializationError),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Tree construction and proof extraction errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MerkleError {
    #[error("Cannot build a merkle tree without leaves")]
    EmptyInput,

    #[error("Leaf is not part of the tree")]
    LeafNotFound,
}

/// Leaf and proof encoding errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EncodingError {
    #[error("Invalid account address: {0}")]
    InvalidAddress(String),

    #[error("Value out of uint256 range: {0}")]
    ValueOutOfRange(String),

    #[error("Record belongs to task {record} but was encoded for task {task}")]
    TaskMismatch { record: TaskId, task: TaskId },

    #[error("Invalid proof encoding: {0}")]
    InvalidProof(String),
}

/// Chain RPC, signing and submission errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChainError {
    #[error("Chain call {operation} timed out after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    #[error("Transaction submission failed: {0}")]
    Submission(String),

    #[error("RPC call failed: {0}")]
    Rpc(String),

    #[error("ABI error: {0}")]
    Abi(String),

    #[error("Invalid signing key: {0}")]
    InvalidKey(String),

    #[error("Refusing to publish an empty batch")]
    EmptyBatch,
}

/// Database operation errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DatabaseError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Query failed: {0}")]
    QueryFailed(String),

    #[error("Record not found: {0}")]
    RecordNotFound(String),

    #[error("Duplicate key: {0}")]
    DuplicateKey(String),
}

/// User task lifecycle violations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RecordError {
    #[error("Invalid status transition from {from} to {to}")]
    InvalidTransition { from: UserTaskStatus, to: UserTaskStatus },

    #[error("Record for task {0} has no proof yet")]
    MissingProof(TaskId),
}

/// Serialization/deserialization errors
#[derive(Error, Debug)]
pub enum SerializationError {
    #[error("JSON serialization failed: {0}")]
    JsonFailed(#[from] serde_json::Error),

    #[error("Invalid data format: {0}")]
    InvalidFormat(String),
}

/// Result type alias for airdrop operations
pub type AirdropResult<T> = Result<T, AirdropError>;

impl AirdropError {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            AirdropError::Chain(ChainError::Timeout { .. }) => true,
            AirdropError::Chain(ChainError::Rpc(_)) => true,
            AirdropError::Chain(ChainError::Submission(_)) => true,
            AirdropError::Database(DatabaseError::ConnectionFailed(_)) => true,
            _ => false,
        }
    }

    /// Get error severity level
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            AirdropError::Merkle(MerkleError::LeafNotFound) => ErrorSeverity::High,
            AirdropError::Chain(ChainError::InvalidKey(_)) => ErrorSeverity::Critical,
            AirdropError::Chain(_) => ErrorSeverity::Medium,
            AirdropError::Database(_) => ErrorSeverity::Medium,
            AirdropError::Config(_) => ErrorSeverity::High,
            _ => ErrorSeverity::Low,
        }
    }
}

/// Error severity levels
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorSeverity {
    Critical,
    High,
    Medium,
    Low,
}
