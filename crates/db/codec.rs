//! Packed on-disk node layout.
//!
//! A serialized node is self-contained: a fixed header, the nibble-packed
//! path, the commitment bytes, the optional value, then one record per child.
//! The whole encoding must fit inside a single chunk. Child offsets are
//! stored with their spare bits zeroed; a reader recovers a child's page
//! span from the `total_len` prefix at its offset. Offsets held anywhere
//! else (the version ring, in-memory slots) keep the page count in the
//! spare.

use bytes::Bytes;

use crate::error::DbError;
use crate::node::{Child, Node, NodeData};
use crate::nibbles::Nibbles;
use crate::offset::{ChunkOffset, CompactVirtualOffset, PACKED_OFFSET_SIZE};

const FLAG_HAS_VALUE: u8 = 1;

/// Fixed part: total_len(4) mask(2) flags(1) data_len(1) path_nibbles(2)
/// value_len(4) version(8).
const HEADER_SIZE: usize = 22;

/// Per-child fixed part: fnext(10) min_fast(4) min_slow(4) min_version(8)
/// data_len(1).
const CHILD_FIXED_SIZE: usize = PACKED_OFFSET_SIZE + 4 + 4 + 8 + 1;

pub fn encoded_len(node: &Node) -> usize {
    let mut len = HEADER_SIZE
        + node.path.len().div_ceil(2)
        + node.data.len()
        + node.value.as_ref().map_or(0, |v| v.len());
    for (_, child) in node.branches() {
        len += CHILD_FIXED_SIZE + child.data.len();
    }
    len
}

/// Serializes `node` into `out`. Child `fnext` offsets are written with the
/// spare bits cleared; the child's own length prefix sizes any later fetch.
pub fn encode_node(node: &Node, out: &mut Vec<u8>) {
    let total = encoded_len(node);
    let start = out.len();
    out.reserve(total);
    out.extend_from_slice(&(total as u32).to_le_bytes());
    out.extend_from_slice(&node.mask.to_le_bytes());
    out.push(if node.value.is_some() { FLAG_HAS_VALUE } else { 0 });
    debug_assert!(node.data.len() <= u8::MAX as usize);
    out.push(node.data.len() as u8);
    out.extend_from_slice(&(node.path.len() as u16).to_le_bytes());
    let value_len = node.value.as_ref().map_or(0, |v| v.len());
    out.extend_from_slice(&(value_len as u32).to_le_bytes());
    out.extend_from_slice(&node.version.to_le_bytes());

    out.extend_from_slice(node.path.as_packed());
    out.extend_from_slice(&node.data);
    if let Some(value) = &node.value {
        out.extend_from_slice(value);
    }
    for (_, child) in node.branches() {
        debug_assert!(child.is_on_disk(), "serializing a child with no offset");
        out.extend_from_slice(&child.fnext.with_spare(0).to_bytes());
        out.extend_from_slice(&child.min_offset_fast.to_raw().to_le_bytes());
        out.extend_from_slice(&child.min_offset_slow.to_raw().to_le_bytes());
        out.extend_from_slice(&child.subtrie_min_version.to_le_bytes());
        debug_assert!(child.data.len() <= u8::MAX as usize);
        out.push(child.data.len() as u8);
        out.extend_from_slice(&child.data);
    }
    debug_assert_eq!(out.len() - start, total);
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], DbError> {
        if self.pos + n > self.buf.len() {
            return Err(DbError::invalid_input("truncated node encoding"));
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, DbError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, DbError> {
        Ok(u16::from_le_bytes(self.take(2)?.try_into().expect("len 2")))
    }

    fn u32(&mut self) -> Result<u32, DbError> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().expect("len 4")))
    }

    fn u64(&mut self) -> Result<u64, DbError> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().expect("len 8")))
    }

    fn offset(&mut self) -> Result<ChunkOffset, DbError> {
        let bytes: [u8; PACKED_OFFSET_SIZE] = self
            .take(PACKED_OFFSET_SIZE)?
            .try_into()
            .expect("len matches");
        Ok(ChunkOffset::from_bytes(bytes))
    }
}

/// Total serialized length of the node starting at `buf[0]`, for callers that
/// sliced a page-aligned read and need the node's extent.
pub fn peek_len(buf: &[u8]) -> Result<usize, DbError> {
    if buf.len() < 4 {
        return Err(DbError::invalid_input("truncated node encoding"));
    }
    Ok(u32::from_le_bytes(buf[..4].try_into().expect("len 4")) as usize)
}

pub fn decode_node(buf: &[u8]) -> Result<Node, DbError> {
    let mut r = Reader { buf, pos: 0 };
    let total = r.u32()? as usize;
    if total > buf.len() || total < HEADER_SIZE {
        return Err(DbError::invalid_input("node length out of bounds"));
    }
    let mask = r.u16()?;
    let flags = r.u8()?;
    let data_len = r.u8()? as usize;
    let path_nibbles = r.u16()? as usize;
    let value_len = r.u32()? as usize;
    let version = r.u64()?;

    let path = Nibbles::from_packed(r.take(path_nibbles.div_ceil(2))?, path_nibbles);
    let data = NodeData::from_slice(r.take(data_len)?);
    let value = if flags & FLAG_HAS_VALUE != 0 {
        Some(Bytes::copy_from_slice(r.take(value_len)?))
    } else {
        None
    };

    let mut node = Node::new_branch(path, value, version);
    node.data = data;
    for branch in 0u8..16 {
        if mask & (1 << branch) == 0 {
            continue;
        }
        let fnext = r.offset()?;
        let min_offset_fast = CompactVirtualOffset::from_raw(r.u32()?);
        let min_offset_slow = CompactVirtualOffset::from_raw(r.u32()?);
        let subtrie_min_version = r.u64()?;
        let child_data_len = r.u8()? as usize;
        let child_data = NodeData::from_slice(r.take(child_data_len)?);
        node.set_child(
            branch,
            Child::new(
                fnext,
                child_data,
                min_offset_fast,
                min_offset_slow,
                subtrie_min_version,
            ),
        );
    }
    debug_assert_eq!(node.mask, mask);
    if r.pos != total {
        return Err(DbError::invalid_input("node length mismatch"));
    }
    Ok(node)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::offset::{INVALID_COMPACT_OFFSET, ListKind, VirtualOffset};

    fn sample_node() -> Node {
        let mut node = Node::new_branch(
            Nibbles::from_nibbles(&[0xd, 0xe, 0xa]),
            Some(Bytes::from_static(b"some value")),
            42,
        );
        node.data = NodeData::from_slice(&[0xaa; 32]);
        node.set_child(
            0x3,
            Child::new(
                ChunkOffset::new(7, 0x1234).with_spare(2),
                NodeData::from_slice(&[0xbb; 32]),
                VirtualOffset::new(ListKind::Fast, 1, 0).to_compact(),
                INVALID_COMPACT_OFFSET,
                40,
            ),
        );
        node.set_child(
            0xc,
            Child::new(
                ChunkOffset::new(9, 0x800).with_spare(1),
                NodeData::from_slice(&[0x01, 0x02]),
                INVALID_COMPACT_OFFSET,
                VirtualOffset::new(ListKind::Slow, 4, 64).to_compact(),
                41,
            ),
        );
        node
    }

    #[test]
    fn roundtrip() {
        let node = sample_node();
        let mut buf = Vec::new();
        encode_node(&node, &mut buf);
        assert_eq!(buf.len(), encoded_len(&node));
        assert_eq!(peek_len(&buf).expect("peek"), buf.len());

        let decoded = decode_node(&buf).expect("decode");
        assert_eq!(decoded.mask, node.mask);
        assert_eq!(decoded.path, node.path);
        assert_eq!(decoded.value, node.value);
        assert_eq!(decoded.version, node.version);
        assert_eq!(decoded.data, node.data);
        for branch in [0x3u8, 0xc] {
            let a = node.child(branch).expect("child");
            let b = decoded.child(branch).expect("child");
            // the spare page count never survives serialization
            assert_eq!(b.fnext, a.fnext.with_spare(0));
            assert_eq!(b.fnext.pages(), 0);
            assert_eq!(a.data, b.data);
            assert_eq!(a.min_offset_fast, b.min_offset_fast);
            assert_eq!(a.min_offset_slow, b.min_offset_slow);
            assert_eq!(a.subtrie_min_version, b.subtrie_min_version);
        }
    }

    #[test]
    fn decode_within_larger_page_buffer() {
        let node = sample_node();
        let mut buf = Vec::new();
        encode_node(&node, &mut buf);
        // trailing page padding must not confuse the decoder
        buf.resize(buf.len() + 512, 0);
        let decoded = decode_node(&buf).expect("decode");
        assert_eq!(decoded.mask, node.mask);
    }

    #[test]
    fn truncation_is_an_error() {
        let node = sample_node();
        let mut buf = Vec::new();
        encode_node(&node, &mut buf);
        buf.truncate(buf.len() - 3);
        assert!(decode_node(&buf).is_err());
    }

    #[test]
    fn leaf_with_empty_path() {
        let node = Node::new_leaf(Nibbles::empty(), Bytes::from_static(b"x"), 0);
        let mut buf = Vec::new();
        encode_node(&node, &mut buf);
        let decoded = decode_node(&buf).expect("decode");
        assert!(decoded.path.is_empty());
        assert_eq!(decoded.value, Some(Bytes::from_static(b"x")));
        assert_eq!(decoded.number_of_children(), 0);
    }

    use proptest::{collection::vec, option, prelude::*, proptest};

    fn arb_node() -> impl Strategy<Value = Node> {
        (
            vec(0u8..16, 0..40),
            option::of(vec(any::<u8>(), 0..200)),
            any::<u64>(),
            vec(any::<u8>(), 0..32),
            vec((0u8..16, any::<u32>(), any::<u64>(), vec(any::<u8>(), 0..32)), 0..8),
        )
            .prop_map(|(path, value, version, data, children)| {
                let mut node = Node::new_branch(
                    Nibbles::from_nibbles(&path),
                    value.map(Bytes::from),
                    version,
                );
                node.data = NodeData::from_slice(&data);
                for (branch, raw_min, min_version, child_data) in children {
                    node.set_child(
                        branch,
                        Child::new(
                            ChunkOffset::new(u32::from(branch), 64 * raw_min as u64)
                                .with_spare(1 + (raw_min % 7) as u16),
                            NodeData::from_slice(&child_data),
                            CompactVirtualOffset::from_raw(raw_min),
                            INVALID_COMPACT_OFFSET,
                            min_version,
                        ),
                    );
                }
                node
            })
    }

    proptest! {
        #[test]
        fn proptest_roundtrip(node in arb_node()) {
            let mut buf = Vec::new();
            encode_node(&node, &mut buf);
            prop_assert_eq!(buf.len(), encoded_len(&node));
            let decoded = decode_node(&buf).expect("decode");
            prop_assert_eq!(decoded.mask, node.mask);
            prop_assert_eq!(&decoded.path, &node.path);
            prop_assert_eq!(&decoded.value, &node.value);
            prop_assert_eq!(decoded.version, node.version);
            prop_assert_eq!(&decoded.data, &node.data);
            for (branch, child) in node.branches() {
                let got = decoded.child(branch).expect("child");
                prop_assert_eq!(got.fnext, child.fnext.with_spare(0));
                prop_assert_eq!(got.fnext.pages(), 0);
                prop_assert_eq!(got.min_offset_fast, child.min_offset_fast);
                prop_assert_eq!(got.subtrie_min_version, child.subtrie_min_version);
                prop_assert_eq!(&got.data, &child.data);
            }
        }
    }
}
