use serde::{Deserialize, Serialize};

use airdrop_common::{to_hex_prefixed, EncodingError, Hash32, HashFunction, MerkleError};
use crate::merkle::{self, MerkleTree};

/// Inclusion proof: sibling hashes ordered from the leaf up to the root
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleProof {
    pub siblings: Vec<Hash32>,
}

/// Extract the proof for `leaf`, identified by the same bytes given to `build`
pub fn prove_leaf(tree: &MerkleTree, leaf: &[u8]) -> Result<MerkleProof, MerkleError> {
    let mut index = tree.position_of(leaf).ok_or(MerkleError::LeafNotFound)?;
    let levels = tree.levels();
    let mut siblings = Vec::with_capacity(tree.depth());

    for level in &levels[..levels.len() - 1] {
        let sibling = index ^ 1;
        // an unpaired node is carried up and has no sibling at this level
        if sibling < level.len() {
            siblings.push(level[sibling]);
        }
        index /= 2;
    }

    Ok(MerkleProof { siblings })
}

impl MerkleProof {
    pub fn len(&self) -> usize {
        self.siblings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.siblings.is_empty()
    }

    /// `0x`-prefixed lowercase hex per sibling, as the contract's `bytes32[]` expects
    pub fn to_hex_strings(&self) -> Vec<String> {
        self.siblings.iter().map(|s| to_hex_prefixed(s)).collect()
    }

    /// JSON array of hex strings stored on `UserTaskRecord.proof`
    pub fn to_json(&self) -> String {
        let hex_strings = self.to_hex_strings();
        // serializing a Vec<String> cannot fail
        serde_json::to_string(&hex_strings).unwrap_or_else(|_| "[]".to_string())
    }

    /// Parse a stored proof string back into sibling hashes
    pub fn from_json(proof: &str) -> Result<Self, EncodingError> {
        let hex_strings: Vec<String> =
            serde_json::from_str(proof).map_err(|e| EncodingError::InvalidProof(e.to_string()))?;

        let mut siblings = Vec::with_capacity(hex_strings.len());
        for entry in hex_strings {
            let digits = entry.strip_prefix("0x").unwrap_or(&entry);
            let bytes = hex::decode(digits).map_err(|e| EncodingError::InvalidProof(format!("{}: {}", entry, e)))?;
            let sibling: Hash32 = bytes
                .as_slice()
                .try_into()
                .map_err(|_| EncodingError::InvalidProof(format!("{} is not 32 bytes", entry)))?;
            siblings.push(sibling);
        }

        Ok(Self { siblings })
    }

    pub fn verify(&self, leaf: &[u8], root: &Hash32, hasher: &dyn HashFunction) -> bool {
        merkle::verify(leaf, &self.siblings, root, hasher)
    }
}
