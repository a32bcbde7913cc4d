//! A versioned, on-disk Merkle Patricia Trie storage engine.
//!
//! State lives in a copy-on-write trie over a chunked, memory-mapped pool.
//! Each upsert produces a new root that shares all unchanged structure with
//! its predecessor; a bounded ring maps recent versions to their roots. One
//! writer thread owns every mutation; read-only handles open the same files
//! and serve lookups without coordinating with the writer. Old state drains
//! away through copy-forward compaction and, optionally, version-based
//! expiration.

mod cache;
mod codec;
mod compact;
pub mod compute;
mod database;
pub mod error;
mod find;
mod history;
pub mod machine;
mod meta;
pub mod nibbles;
pub mod node;
pub mod offset;
mod pool;
mod ring;
mod rlp;
#[cfg(test)]
mod test_utils;
mod update;
mod worker;

use ethereum_types::H256;
use lazy_static::lazy_static;

pub use self::compute::{Compute, IdentityCompute, MerkleCompute};
pub use self::database::{Db, DbConfig, RoDb};
pub use self::error::{DbError, FindResult};
pub use self::machine::{
    INVALID_BRANCH, MerkleMachine, StateMachine, TraverseMachine, TraverseStep,
};
pub use self::nibbles::{Nibbles, NibblesView};
pub use self::node::{Child, Node, NodeCursor, NodeData};
pub use self::update::{Update, UpdateList};

lazy_static! {
    /// Hash of the empty trie, `keccak(rlp(null))`.
    pub static ref EMPTY_TRIE_HASH: H256 = MerkleCompute.empty_root();
}
