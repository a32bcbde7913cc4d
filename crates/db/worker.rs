//! The writer thread and its request queue.
//!
//! All mutation and all async read drivers run on one dedicated OS thread.
//! Foreground threads push typed requests onto a lock-free channel and block
//! on the paired oneshot future. When the queue runs dry the worker parks on
//! a condvar; a submitter that observes the `sleeping` flag signals it. The
//! park uses a one-second timeout so a wakeup lost in the unsynchronized
//! window between the empty-check and the flag-set is only ever a bounded
//! stall, never a hang.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam::channel::{Receiver, Sender, TryRecvError, unbounded};
use ethereum_types::H256;
use futures::channel::oneshot;
use parking_lot::{Condvar, Mutex, RwLock};
use tracing::debug;

use crate::database::{WriterState, handle_request};
use crate::error::{DbError, FindResult};
use crate::machine::TraverseMachine;
use crate::nibbles::Nibbles;
use crate::node::{Node, NodeCursor};
use crate::update::UpdateList;

pub(crate) type Reply<T> = oneshot::Sender<Result<T, DbError>>;

pub(crate) enum Request {
    Upsert {
        updates: UpdateList,
        version: u64,
        enable_compaction: bool,
        can_write_to_fast: bool,
        write_root: bool,
        reply: Reply<()>,
    },
    Find {
        key: Nibbles,
        version: u64,
        reply: Reply<(Option<NodeCursor>, FindResult)>,
    },
    Traverse {
        version: u64,
        machine: Box<dyn TraverseMachine>,
        concurrency: usize,
        reply: Reply<(bool, Box<dyn TraverseMachine>)>,
    },
    CopyTrie {
        src_version: u64,
        src_path: Nibbles,
        dst_version: u64,
        dst_path: Nibbles,
        blocked_by_write: bool,
        reply: Reply<()>,
    },
    MoveTrieVersion {
        src: u64,
        dst: u64,
        reply: Reply<()>,
    },
    LoadRootVersion {
        version: u64,
        reply: Reply<Option<Arc<Node>>>,
    },
    RewindToVersion {
        version: u64,
        reply: Reply<()>,
    },
    SetFinalized {
        version: u64,
        reply: Reply<()>,
    },
    SetVerified {
        version: u64,
        reply: Reply<()>,
    },
    SetVoted {
        version: u64,
        block_id: H256,
        reply: Reply<()>,
    },
}

pub(crate) struct SleepHandshake {
    sleeping: Mutex<bool>,
    cvar: Condvar,
}

impl SleepHandshake {
    pub fn new() -> Self {
        Self {
            sleeping: Mutex::new(false),
            cvar: Condvar::new(),
        }
    }

    /// Called by submitters after pushing onto the queue.
    pub fn notify(&self) {
        let sleeping = self.sleeping.lock();
        if *sleeping {
            self.cvar.notify_one();
        }
    }
}

pub(crate) fn channel() -> (Sender<Request>, Receiver<Request>) {
    unbounded()
}

/// How many empty polls the worker tolerates before parking.
const IDLE_SPINS: u32 = 64;

pub(crate) fn spawn(
    state: Arc<RwLock<WriterState>>,
    queue: Receiver<Request>,
    sleep: Arc<SleepHandshake>,
) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name("triedb-writer".into())
        .spawn(move || run(state, queue, sleep))
        .expect("spawning the writer thread")
}

fn run(state: Arc<RwLock<WriterState>>, queue: Receiver<Request>, sleep: Arc<SleepHandshake>) {
    debug!("writer thread started");
    let mut spins = 0u32;
    loop {
        match queue.try_recv() {
            Ok(request) => {
                spins = 0;
                let mut state = state.write();
                handle_request(&mut state, request);
            }
            Err(TryRecvError::Empty) => {
                spins += 1;
                if spins < IDLE_SPINS {
                    std::thread::yield_now();
                    continue;
                }
                spins = 0;
                let mut sleeping = sleep.sleeping.lock();
                *sleeping = true;
                // a request may have landed between try_recv and the lock;
                // the bounded wait covers that lost wakeup
                sleep
                    .cvar
                    .wait_for(&mut sleeping, Duration::from_secs(1));
                *sleeping = false;
            }
            Err(TryRecvError::Disconnected) => break,
        }
    }
    debug!("writer thread exiting");
}
