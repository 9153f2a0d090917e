use std::path::Path;

use web3::ethabi::{Contract, Function, Token};
use ethereum_types::U256;
use tracing::debug;

use airdrop_common::{ChainError, Hash32, RootPair, TaskId};
use crate::proof::MerkleProof;

pub const SET_MERKLE_ROOT: &str = "setMerkleRoot";
pub const SET_REWARD: &str = "setReward";
pub const CLAIM: &str = "claim";

/// Call-data packer for the airdrop registry contract, backed by its ABI
#[derive(Debug, Clone)]
pub struct AbiPacker {
    contract: Contract,
}

impl AbiPacker {
    /// Load the contract ABI from a JSON file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ChainError> {
        let path = path.as_ref();
        let file = std::fs::File::open(path)
            .map_err(|e| ChainError::Abi(format!("failed to read ABI file {}: {}", path.display(), e)))?;
        let contract = Contract::load(file)
            .map_err(|e| ChainError::Abi(format!("failed to parse ABI file {}: {}", path.display(), e)))?;
        debug!("Loaded contract ABI from {}", path.display());
        Ok(Self { contract })
    }

    pub fn from_json(json: &str) -> Result<Self, ChainError> {
        let contract = Contract::load(json.as_bytes()).map_err(|e| ChainError::Abi(format!("failed to parse ABI: {}", e)))?;
        Ok(Self { contract })
    }

    pub fn function(&self, name: &str) -> Result<&Function, ChainError> {
        self.contract
            .function(name)
            .map_err(|e| ChainError::Abi(format!("{}: {}", name, e)))
    }

    /// Encode a call to `name` with typed arguments
    pub fn pack(&self, name: &str, args: &[Token]) -> Result<Vec<u8>, ChainError> {
        self.function(name)?
            .encode_input(args)
            .map_err(|e| ChainError::Abi(format!("failed to encode {}: {}", name, e)))
    }

    /// `setMerkleRoot(uint256[] taskIds, bytes32[] roots)` for one batch
    pub fn encode_set_merkle_root(&self, pairs: &[RootPair]) -> Result<Vec<u8>, ChainError> {
        let task_ids = pairs.iter().map(|p| Token::Uint(p.task_id.as_u256())).collect();
        let roots = pairs.iter().map(|p| Token::FixedBytes(p.root.to_vec())).collect();
        self.pack(SET_MERKLE_ROOT, &[Token::Array(task_ids), Token::Array(roots)])
    }

    /// Inverse of `encode_set_merkle_root`; pairs come back in call order
    pub fn decode_set_merkle_root(&self, call_data: &[u8]) -> Result<Vec<RootPair>, ChainError> {
        let function = self.function(SET_MERKLE_ROOT)?;
        let args = self.strip_selector(function, call_data)?;
        let tokens = function
            .decode_input(args)
            .map_err(|e| ChainError::Abi(format!("failed to decode {}: {}", SET_MERKLE_ROOT, e)))?;

        let (task_ids, roots) = match tokens.as_slice() {
            [Token::Array(ids), Token::Array(roots)] => (ids, roots),
            _ => return Err(ChainError::Abi(format!("unexpected {} arguments", SET_MERKLE_ROOT))),
        };
        if task_ids.len() != roots.len() {
            return Err(ChainError::Abi(format!(
                "{} has {} task ids but {} roots",
                SET_MERKLE_ROOT,
                task_ids.len(),
                roots.len()
            )));
        }

        task_ids
            .iter()
            .zip(roots)
            .map(|(id, root)| Ok(RootPair::new(token_to_task_id(id)?, token_to_hash(root)?)))
            .collect()
    }

    /// `setReward(uint256[] taskIds, uint256[] amounts)`
    pub fn encode_set_reward(&self, rewards: &[(TaskId, U256)]) -> Result<Vec<u8>, ChainError> {
        let task_ids = rewards.iter().map(|(id, _)| Token::Uint(id.as_u256())).collect();
        let amounts = rewards.iter().map(|(_, amount)| Token::Uint(*amount)).collect();
        self.pack(SET_REWARD, &[Token::Array(task_ids), Token::Array(amounts)])
    }

    /// `claim(uint256 taskId, uint256 amount, bytes32[] proof)` as submitted by the
    /// user's wallet when redeeming a stored proof
    pub fn encode_claim(&self, task_id: TaskId, amount: U256, proof: &MerkleProof) -> Result<Vec<u8>, ChainError> {
        let siblings = proof.siblings.iter().map(|s| Token::FixedBytes(s.to_vec())).collect();
        self.pack(CLAIM, &[Token::Uint(task_id.as_u256()), Token::Uint(amount), Token::Array(siblings)])
    }

    fn strip_selector<'a>(&self, function: &Function, call_data: &'a [u8]) -> Result<&'a [u8], ChainError> {
        if call_data.len() < 4 || call_data[..4] != function.short_signature() {
            return Err(ChainError::Abi(format!("call data is not a {} call", function.name)));
        }
        Ok(&call_data[4..])
    }
}

fn token_to_task_id(token: &Token) -> Result<TaskId, ChainError> {
    match token {
        Token::Uint(value) if value.bits() <= 64 => Ok(TaskId(value.low_u64())),
        other => Err(ChainError::Abi(format!("{:?} is not a task id", other))),
    }
}

fn token_to_hash(token: &Token) -> Result<Hash32, ChainError> {
    match token {
        Token::FixedBytes(bytes) if bytes.len() == 32 => {
            let mut hash = [0u8; 32];
            hash.copy_from_slice(bytes);
            Ok(hash)
        }
        other => Err(ChainError::Abi(format!("{:?} is not a bytes32", other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use airdrop_common::keccak256;

    const AIRDROP_ABI: &str = include_str!("../abi/Airdrop.json");

    fn packer() -> AbiPacker {
        AbiPacker::from_json(AIRDROP_ABI).unwrap()
    }

    #[test]
    fn test_set_merkle_root_selector() {
        let data = packer().encode_set_merkle_root(&[RootPair::new(TaskId(1), [7u8; 32])]).unwrap();
        let selector = keccak256(b"setMerkleRoot(uint256[],bytes32[])");
        assert_eq!(&data[..4], &selector[..4]);
    }

    #[test]
    fn test_set_merkle_root_decodes_in_order() {
        let pairs = vec![
            RootPair::new(TaskId(9), [0x11u8; 32]),
            RootPair::new(TaskId(2), [0x22u8; 32]),
            RootPair::new(TaskId(5), [0x33u8; 32]),
        ];
        let packer = packer();
        let data = packer.encode_set_merkle_root(&pairs).unwrap();
        assert_eq!(packer.decode_set_merkle_root(&data).unwrap(), pairs);
    }

    #[test]
    fn test_decode_rejects_foreign_call() {
        let packer = packer();
        let data = packer.encode_set_reward(&[(TaskId(1), U256::from(100u64))]).unwrap();
        assert!(matches!(packer.decode_set_merkle_root(&data), Err(ChainError::Abi(_))));
        assert!(packer.decode_set_merkle_root(&[0u8; 2]).is_err());
    }

    #[test]
    fn test_claim_encoding() {
        let proof = MerkleProof { siblings: vec![[0x44u8; 32]] };
        let data = packer().encode_claim(TaskId(1), U256::from(100u64), &proof).unwrap();
        let selector = keccak256(b"claim(uint256,uint256,bytes32[])");
        assert_eq!(&data[..4], &selector[..4]);
        // selector + taskId + amount + offset + length + one element
        assert_eq!(data.len(), 4 + 32 * 5);
    }

    #[test]
    fn test_unknown_function() {
        assert!(matches!(packer().pack("withdrawAll", &[]), Err(ChainError::Abi(_))));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Airdrop.json");
        std::fs::write(&path, AIRDROP_ABI).unwrap();
        assert!(AbiPacker::from_file(&path).is_ok());
        assert!(AbiPacker::from_file(dir.path().join("missing.json")).is_err());
    }
}
