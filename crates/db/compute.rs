//! The pluggable commitment seam.
//!
//! The update engine never interprets commitment bytes; it stores whatever
//! the compute function returns in `Node::data` and mirrors it into the
//! parent's child slot. [`MerkleCompute`] produces Ethereum-compatible MPT
//! hashes: references shorter than 32 bytes stay inline, everything else is
//! the Keccak-256 of the node's RLP.

use dyn_clone::DynClone;
use ethereum_types::H256;
use sha3::{Digest, Keccak256};

use crate::node::{Node, NodeData};
use crate::rlp::{RLP_NULL, encode_bytes, encode_list, hex_prefix};

pub trait Compute: DynClone + Send + Sync {
    /// Commitment for a node whose child slots already carry their
    /// children's commitments.
    fn compute(&self, node: &Node) -> NodeData;

    /// Collapse a commitment into the fixed root form.
    fn finalize(&self, data: &NodeData) -> H256;

    fn empty_root(&self) -> H256;
}

dyn_clone::clone_trait_object!(Compute);

pub fn keccak(bytes: &[u8]) -> H256 {
    H256::from_slice(Keccak256::digest(bytes).as_slice())
}

/// Ethereum Merkle Patricia Trie commitment. A unified node maps onto the
/// classical shapes: no children ⇒ leaf; children with an empty path ⇒
/// branch; children under a non-empty path ⇒ extension over a branch. A
/// value co-located with children lands in the branch's 17th slot.
#[derive(Clone, Default, Debug)]
pub struct MerkleCompute;

impl MerkleCompute {
    fn reference(rlp: Vec<u8>) -> NodeData {
        if rlp.len() < 32 {
            NodeData::from_vec(rlp)
        } else {
            NodeData::from_slice(keccak(&rlp).as_bytes())
        }
    }

    fn branch_rlp(node: &Node) -> Vec<u8> {
        let mut payload = Vec::new();
        for branch in 0u8..16 {
            match node.child(branch) {
                // a 32-byte entry is a hash; shorter entries are already RLP
                Some(child) if child.data.len() == 32 => {
                    encode_bytes(&mut payload, &child.data);
                }
                Some(child) => payload.extend_from_slice(&child.data),
                None => payload.push(RLP_NULL),
            }
        }
        match &node.value {
            Some(value) => encode_bytes(&mut payload, value),
            None => payload.push(RLP_NULL),
        }
        let mut rlp = Vec::new();
        encode_list(&mut rlp, &payload);
        rlp
    }
}

impl Compute for MerkleCompute {
    fn compute(&self, node: &Node) -> NodeData {
        if node.number_of_children() == 0 {
            let value = node.value.as_deref().unwrap_or_default();
            let mut payload = Vec::new();
            encode_bytes(&mut payload, &hex_prefix(node.path_view(), true));
            encode_bytes(&mut payload, value);
            let mut rlp = Vec::new();
            encode_list(&mut rlp, &payload);
            return Self::reference(rlp);
        }

        let branch = Self::branch_rlp(node);
        if node.path.is_empty() {
            return Self::reference(branch);
        }

        let mut payload = Vec::new();
        encode_bytes(&mut payload, &hex_prefix(node.path_view(), false));
        if branch.len() < 32 {
            payload.extend_from_slice(&branch);
        } else {
            encode_bytes(&mut payload, keccak(&branch).as_bytes());
        }
        let mut rlp = Vec::new();
        encode_list(&mut rlp, &payload);
        Self::reference(rlp)
    }

    fn finalize(&self, data: &NodeData) -> H256 {
        if data.len() == 32 {
            H256::from_slice(data)
        } else {
            keccak(data)
        }
    }

    fn empty_root(&self) -> H256 {
        keccak(&[RLP_NULL])
    }
}

/// No-op commitment for structural tests that never look at hashes.
#[derive(Clone, Default, Debug)]
pub struct IdentityCompute;

impl Compute for IdentityCompute {
    fn compute(&self, _node: &Node) -> NodeData {
        NodeData::new()
    }

    fn finalize(&self, _data: &NodeData) -> H256 {
        H256::zero()
    }

    fn empty_root(&self) -> H256 {
        H256::zero()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::nibbles::Nibbles;
    use bytes::Bytes;
    use hex_literal::hex;

    #[test]
    fn empty_root_is_canonical() {
        assert_eq!(
            MerkleCompute.empty_root(),
            H256(hex!(
                "56e81f171bcc55a6ff8345e692c0f86e5b48e01b996cadc001622fb5e363b421"
            ))
        );
    }

    #[test]
    fn single_leaf_matches_reference() {
        let key = hex!("1234567812345678123456781234567812345678123456781234567812345678");
        let value = hex!("deadbeefdeadbeefdeadbeefdeadbeefdeadbeefdeadbeefdeadbeefdeadbeef");
        let node = Node::new_leaf(
            Nibbles::from_bytes(&key),
            Bytes::copy_from_slice(&value),
            0,
        );
        let data = MerkleCompute.compute(&node);
        assert_eq!(
            MerkleCompute.finalize(&data),
            H256(hex!(
                "a1aa368afa323866e03c21927db548afda3da793f4d3c646d7dd8109477b907e"
            ))
        );
    }

    #[test]
    fn tiny_leaf_stays_inline() {
        let node = Node::new_leaf(
            Nibbles::from_bytes(&hex!("12")),
            Bytes::from_static(&[0x01]),
            0,
        );
        let data = MerkleCompute.compute(&node);
        // list[hp, value] = [0xc4, 0x82, 0x20, 0x12, 0x01]
        assert_eq!(data.as_slice(), &[0xc4, 0x82, 0x20, 0x12, 0x01]);
        // finalize still produces a fixed-width root
        assert_eq!(MerkleCompute.finalize(&data), keccak(&data));
    }
}
