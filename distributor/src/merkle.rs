use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use airdrop_common::{to_hex_prefixed, Hash32, HashFunction, MerkleError};

/// Hash two sibling nodes as `min ‖ max` so verification is order-free
pub fn hash_pair(hasher: &dyn HashFunction, a: &Hash32, b: &Hash32) -> Hash32 {
    if a <= b {
        hasher.hash_concat(a, b)
    } else {
        hasher.hash_concat(b, a)
    }
}

/// Sorted-pair merkle tree over one task's leaves.
///
/// Leaf nodes are `hash(leaf)` sorted ascending, parents are
/// `hash(min ‖ max)` and an unpaired last node is carried up unchanged. The
/// root exists from construction on.
pub struct MerkleTree {
    hasher: Arc<dyn HashFunction>,
    /// Pre-hash leaf content -> position in `levels[0]`
    positions: HashMap<Vec<u8>, usize>,
    /// `levels[0]` are the sorted leaf nodes, the last level holds the root
    levels: Vec<Vec<Hash32>>,
    leaf_count: usize,
}

impl MerkleTree {
    pub fn build<L: AsRef<[u8]>>(leaves: &[L], hasher: Arc<dyn HashFunction>) -> Result<Self, MerkleError> {
        if leaves.is_empty() {
            return Err(MerkleError::EmptyInput);
        }

        let mut nodes: Vec<(Hash32, &[u8])> = leaves
            .iter()
            .map(|l| (hasher.hash(l.as_ref()), l.as_ref()))
            .collect();
        nodes.sort_by(|a, b| a.0.cmp(&b.0));

        let mut positions = HashMap::with_capacity(nodes.len());
        for (i, (_, content)) in nodes.iter().enumerate() {
            positions.entry(content.to_vec()).or_insert(i);
        }

        let mut level: Vec<Hash32> = nodes.into_iter().map(|(h, _)| h).collect();
        let mut levels = Vec::new();
        while level.len() > 1 {
            let mut next = Vec::with_capacity((level.len() + 1) / 2);
            for pair in level.chunks(2) {
                if let [left, right] = pair {
                    next.push(hash_pair(hasher.as_ref(), left, right));
                } else {
                    next.push(pair[0]);
                }
            }
            levels.push(level);
            level = next;
        }
        levels.push(level);

        Ok(Self {
            hasher,
            positions,
            levels,
            leaf_count: leaves.len(),
        })
    }

    pub fn root(&self) -> Hash32 {
        // build() always leaves exactly one node in the top level
        self.levels[self.levels.len() - 1][0]
    }

    pub fn root_hex(&self) -> String {
        to_hex_prefixed(&self.root())
    }

    /// Number of leaves given to `build`, duplicates included
    pub fn leaf_count(&self) -> usize {
        self.leaf_count
    }

    /// Number of hashing levels above the leaves
    pub fn depth(&self) -> usize {
        self.levels.len() - 1
    }

    pub fn levels(&self) -> &[Vec<Hash32>] {
        &self.levels
    }

    pub fn contains(&self, leaf: &[u8]) -> bool {
        self.positions.contains_key(leaf)
    }

    /// Position of the leaf's node in the sorted bottom level
    pub fn position_of(&self, leaf: &[u8]) -> Option<usize> {
        self.positions.get(leaf).copied()
    }

    pub fn hasher(&self) -> &Arc<dyn HashFunction> {
        &self.hasher
    }
}

impl fmt::Debug for MerkleTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MerkleTree")
            .field("hasher", &self.hasher.name())
            .field("leaf_count", &self.leaf_count)
            .field("depth", &self.depth())
            .field("root", &self.root_hex())
            .finish()
    }
}

/// Fold `leaf` with the sibling list and compare against `root`
pub fn verify(leaf: &[u8], proof: &[Hash32], root: &Hash32, hasher: &dyn HashFunction) -> bool {
    let mut current = hasher.hash(leaf);
    for sibling in proof {
        current = hash_pair(hasher, &current, sibling);
    }
    &current == root
}
