use bitcoin::Txid;
use bitcoin::hashes::{Hash, sha256d};

/// Inclusion proof of a transaction in a block, in the layout the relay contract verifies.
///
/// All hashes are in internal byte order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MerkleProof {
    pub reversed_txid: [u8; 32],
    /// Index of the transaction within the block.
    pub pos: u32,
    /// Sibling hashes from the leaf level up to, but excluding, the root.
    pub merkle: Vec<[u8; 32]>,
}

impl MerkleProof {
    /// Folds the proof back into the merkle root it commits to.
    pub fn compute_root(&self) -> [u8; 32] {
        let mut current = self.reversed_txid;
        let mut pos = self.pos;
        for sibling in &self.merkle {
            current = if pos % 2 == 0 {
                hash_pair(&current, sibling)
            } else {
                hash_pair(sibling, &current)
            };
            pos /= 2;
        }
        current
    }
}

fn hash_pair(left: &[u8; 32], right: &[u8; 32]) -> [u8; 32] {
    let mut engine = [0u8; 64];
    engine[..32].copy_from_slice(left);
    engine[32..].copy_from_slice(right);
    sha256d::Hash::hash(&engine).to_byte_array()
}

/// Builds the merkle proof for `txids[index]`.
///
/// Returns `None` if `index` is out of range.
pub fn compute_merkle_proof(txids: &[Txid], index: usize) -> Option<MerkleProof> {
    if index >= txids.len() {
        return None;
    }

    let mut level: Vec<[u8; 32]> = txids.iter().map(|txid| txid.to_byte_array()).collect();
    let mut pos = index;
    let mut merkle = Vec::new();

    while level.len() > 1 {
        // An odd level is completed by duplicating its last hash.
        if level.len() % 2 == 1 {
            let last = *level.last().expect("Level is not empty; qed");
            level.push(last);
        }

        merkle.push(level[pos ^ 1]);

        level = level
            .chunks_exact(2)
            .map(|pair| hash_pair(&pair[0], &pair[1]))
            .collect();
        pos /= 2;
    }

    Some(MerkleProof {
        reversed_txid: txids[index].to_byte_array(),
        pos: index as u32,
        merkle,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::TxMerkleNode;

    fn txids(count: u8) -> Vec<Txid> {
        (0..count)
            .map(|i| Txid::from_byte_array(sha256d::Hash::hash(&[i]).to_byte_array()))
            .collect()
    }

    fn expected_root(txids: &[Txid]) -> [u8; 32] {
        bitcoin::merkle_tree::calculate_root(
            txids
                .iter()
                .map(|txid| TxMerkleNode::from_raw_hash(txid.to_raw_hash())),
        )
        .expect("Non-empty txids")
        .to_byte_array()
    }

    #[test]
    fn proofs_fold_into_block_merkle_root() {
        for count in [1u8, 2, 3, 5, 8, 11] {
            let txids = txids(count);
            let root = expected_root(&txids);
            for index in 0..txids.len() {
                let proof = compute_merkle_proof(&txids, index).unwrap();
                assert_eq!(proof.pos as usize, index);
                assert_eq!(proof.compute_root(), root, "count {count} index {index}");
            }
        }
    }

    #[test]
    fn single_transaction_block_has_empty_proof() {
        let txids = txids(1);
        let proof = compute_merkle_proof(&txids, 0).unwrap();
        assert!(proof.merkle.is_empty());
        assert_eq!(proof.compute_root(), txids[0].to_byte_array());
    }

    #[test]
    fn proof_depth_is_tree_height() {
        let txids = txids(5);
        assert_eq!(compute_merkle_proof(&txids, 4).unwrap().merkle.len(), 3);
        assert!(compute_merkle_proof(&txids, 5).is_none());
    }
}
