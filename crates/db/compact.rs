//! Copy-forward compaction and auto-expiration.
//!
//! Both run inside an upsert, on untouched child slots the descent would
//! otherwise carry over verbatim. Compaction rewrites subtries that still
//! reference chunks below the per-list frontiers so those chunks can drain;
//! expiration prunes subtries wholly older than the version frontier and
//! rebuilds the partially-old ones. Chunks whose last live reference has
//! left (checked against every version in the ring) are returned to the
//! free list after the upsert publishes its root.

use std::sync::Arc;

use tracing::{debug, trace};

use crate::error::DbError;
use crate::machine::StateMachine;
use crate::node::{Child, Node};
use crate::offset::{ListKind, VirtualOffset};
use crate::update::{
    Finished, UpdateAux, UpsertCtx, finish_node, resolve_child, rewrite_node,
};

/// Copy a subtrie forward out of the chunks below the compaction frontier.
/// Content and commitments are unchanged; only physical placement moves.
/// The rewritten node lands on the fast list if anything below it still
/// references fast-list data, otherwise on the slow list.
pub(crate) fn compact_child(
    aux: &mut UpdateAux,
    sm: &mut dyn StateMachine,
    ctx: &UpsertCtx,
    child: Child,
) -> Result<Finished, DbError> {
    let node = resolve_child(aux, &child)?;
    let mut copy = Node::new_branch(node.path.clone(), node.value.clone(), node.version);
    copy.data = node.data.clone();
    for (branch, grandchild) in node.branches() {
        if crate::update::below_compaction_frontier(aux, grandchild) {
            sm.down(branch);
            let finished = compact_child(aux, sm, ctx, grandchild.clone())?;
            sm.up(1);
            let keep_resident = grandchild.loaded().is_some() || sm.cache();
            copy.set_child(branch, finished.to_child(keep_resident));
        } else {
            copy.set_child(branch, grandchild.clone());
        }
    }

    let (min_fast, _) = copy.min_offsets();
    let kind = if min_fast.is_invalid() {
        ListKind::Slow
    } else {
        ListKind::Fast
    };
    trace!(?kind, version = copy.version, "compaction copied node forward");
    rewrite_node(aux, Arc::new(copy), kind)
}

/// Apply the expiration frontier to a subtrie: drop it entirely when even
/// its newest write is older than the frontier, otherwise rebuild it with
/// the stale branches pruned. Returns `None` when nothing survives.
pub(crate) fn expire_child(
    aux: &mut UpdateAux,
    sm: &mut dyn StateMachine,
    ctx: &UpsertCtx,
    child: Child,
    expire_before: u64,
) -> Result<Option<Finished>, DbError> {
    let node = resolve_child(aux, &child)?;
    // node.version is the maximum write version across the subtrie
    if node.version < expire_before {
        trace!(version = node.version, expire_before, "expired whole subtrie");
        return Ok(None);
    }
    let mut kept = Node::new_branch(node.path.clone(), node.value.clone(), node.version);
    for (branch, grandchild) in node.branches() {
        if grandchild.subtrie_min_version < expire_before {
            sm.down(branch);
            let survived = expire_child(aux, sm, ctx, grandchild.clone(), expire_before)?;
            sm.up(1);
            if let Some(finished) = survived {
                kept.set_child(branch, finished.to_child(sm.cache()));
            }
        } else {
            kept.set_child(branch, grandchild.clone());
        }
    }
    // the create-node rule collapses a lone surviving child into its parent
    finish_node(aux, sm, ctx, kept)
}

/// Raise the compaction frontiers when free chunks run short, targeting the
/// oldest chunk of each list so the next upserts copy its live data forward.
pub(crate) fn advance_frontiers(aux: &mut UpdateAux) {
    if !aux.compaction_enabled {
        return;
    }
    let Some(disk) = aux.disk.as_ref() else {
        return;
    };
    let low_watermark = (disk.lists.chunk_count() / 8).max(2);
    if disk.lists.free_len() >= low_watermark {
        return;
    }
    for kind in [ListKind::Fast, ListKind::Slow] {
        // never target the chunk the writer is still filling
        if disk.lists.len(kind) < 2 {
            continue;
        }
        let Some(oldest) = disk.lists.oldest(kind) else {
            continue;
        };
        let frontier = VirtualOffset::new(kind, disk.lists.ordinal(oldest) + 1, 0).to_compact();
        let slot = match kind {
            ListKind::Fast => &mut aux.fields.compact_frontier_fast,
            ListKind::Slow => &mut aux.fields.compact_frontier_slow,
        };
        // frontiers only move forward; the invalid sentinel means "none yet"
        *slot = if slot.is_invalid() {
            frontier
        } else {
            (*slot).max(frontier)
        };
        debug!(?kind, chunk = oldest, "compaction frontier advanced");
    }
}

/// Return chunks to the free list once no version in the ring can reach
/// them. A chunk retires when every live root's minimum offset for its list
/// lies in a strictly newer chunk.
pub(crate) fn release_retired_chunks(aux: &mut UpdateAux) -> usize {
    let (live_fast, live_slow) = aux.live_min_offsets();
    let (cursor_fast, cursor_slow) = (aux.fields.cursor_fast.chunk, aux.fields.cursor_slow.chunk);
    let Some(disk) = aux.disk.as_mut() else {
        return 0;
    };
    let mut released = 0;
    for (kind, live_min) in [(ListKind::Fast, live_fast), (ListKind::Slow, live_slow)] {
        let cursor_chunk = match kind {
            ListKind::Fast => cursor_fast,
            ListKind::Slow => cursor_slow,
        };
        while let Some(oldest) = disk.lists.oldest(kind) {
            if oldest == cursor_chunk {
                break;
            }
            let retire = match live_min.ordinal() {
                // all live references sit in strictly newer chunks
                Some(min_ordinal) => disk.lists.ordinal(oldest) < min_ordinal,
                // no live references into this list at all
                None => true,
            };
            if !retire {
                break;
            }
            disk.lists.release(oldest);
            released += 1;
            debug!(?kind, chunk = oldest, "retired chunk to free list");
        }
    }
    released
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::machine::MerkleMachine;
    use crate::meta::header_len;
    use crate::pool::{Pool, PoolConfig};
    use crate::test_utils::{key_nibbles, open_anon_aux, value};
    use crate::update::{Update, upsert};

    fn filled_aux(keys: u8, version: u64) -> (UpdateAux, Finished) {
        let mut aux = open_anon_aux(64);
        let updates = (0..keys)
            .map(|i| Update::put(key_nibbles(&[i, i]), value(&[i; 24]), version))
            .collect();
        let mut sm = MerkleMachine::new(64, false);
        let finished = upsert(&mut aux, &mut sm, None, updates, version, true, true)
            .expect("upsert")
            .expect("root");
        (aux, finished)
    }

    #[test]
    fn compaction_rewrites_below_frontier() {
        let (mut aux, root) = filled_aux(8, 0);
        let root_node = root.node.clone();
        let old_offset = root.offset;
        crate::update::flush_and_set_root(&mut aux, 0, root.offset).expect("flush");
        aux.record_version_mins(0, root.root_mins());

        // frontier beyond every written chunk: everything must move
        let max_ordinal = aux
            .disk
            .as_ref()
            .expect("disk")
            .lists
            .next_ordinal_hint(ListKind::Fast);
        aux.fields.compact_frontier_fast =
            VirtualOffset::new(ListKind::Fast, max_ordinal, 0).to_compact();
        let mut sm = MerkleMachine::new(64, false);
        let ctx = UpsertCtx {
            version: 1,
            to_fast: true,
            compaction: true,
            expire_before: None,
        };
        let child = root.to_child(true);
        let moved = compact_child(&mut aux, &mut sm, &ctx, child).expect("compact");
        assert_ne!(moved.offset, old_offset);
        // commitment is untouched by physical movement
        assert_eq!(moved.node.data, root_node.data);
        // nothing hot below: the whole subtrie moved to the slow list
        assert!(moved.min_offset_fast.is_invalid());
        assert!(!moved.min_offset_slow.is_invalid());
        assert!(
            aux.disk.as_ref().expect("disk").lists.len(ListKind::Slow) > 0,
            "cold rewrite must allocate slow chunks"
        );
    }

    #[test]
    fn frontier_advances_only_under_pressure() {
        let history_len = 4u64;
        let chunk_size = 1u64 << 16;
        let hdr = header_len(64, history_len);
        let pool = Pool::open(&PoolConfig::anonymous(1 << 21, chunk_size, hdr)).expect("pool");
        let lists = crate::meta::ChunkLists::new(pool.chunk_count());
        let fields = crate::meta::MetaFields::default();
        let disk = crate::update::DiskState::new(pool, lists, &fields, 8);
        let mut aux = UpdateAux::on_disk(
            disk,
            fields,
            crate::history::RootHistory::new(history_len as usize),
            true,
            None,
        );
        advance_frontiers(&mut aux);
        // plenty of free chunks: no frontier movement
        assert!(aux.fields.compact_frontier_fast.is_invalid());
    }

    #[test]
    fn retire_skips_cursor_chunk() {
        let (mut aux, root) = filled_aux(4, 0);
        crate::update::flush_and_set_root(&mut aux, 0, root.offset).expect("flush");
        aux.record_version_mins(0, root.root_mins());
        // the single fast chunk holds both the data and the cursor
        assert_eq!(release_retired_chunks(&mut aux), 0);
    }

    #[test]
    fn expire_prunes_wholly_old_subtrie() {
        let mut aux = open_anon_aux(64);
        let mut sm = MerkleMachine::new(64, true);
        let old = upsert(
            &mut aux,
            &mut sm,
            None,
            vec![
                Update::put(key_nibbles(&[0x11, 0x11]), value(b"old"), 0),
                Update::put(key_nibbles(&[0x22, 0x22]), value(b"kept"), 0),
            ],
            0,
            true,
            true,
        )
        .expect("upsert")
        .expect("root");

        // refresh one branch at version 5 so only the other is stale
        let refreshed = upsert(
            &mut aux,
            &mut sm,
            Some(old.node.clone()),
            vec![Update::put(key_nibbles(&[0x22, 0x22]), value(b"kept2"), 5)],
            5,
            true,
            true,
        )
        .expect("upsert")
        .expect("root");

        let ctx = UpsertCtx {
            version: 6,
            to_fast: true,
            compaction: false,
            expire_before: Some(3),
        };
        let child = refreshed.to_child(true);
        let survived = expire_child(&mut aux, &mut sm, &ctx, child, 3)
            .expect("expire")
            .expect("something survives");
        // the stale 0x11 branch is gone; the node collapsed onto 0x22's leaf
        assert_eq!(survived.node.number_of_children(), 0);
        assert_eq!(survived.node.value, Some(value(b"kept2")));
    }
}
