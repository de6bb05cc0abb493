//! Node budget and deferred reclamation.
//!
//! Every node counts against the table's capacity from allocation until it is
//! actually freed. Unlinked nodes are handed to the epoch collector and only
//! dropped once no pinned reader can still be traversing them, so for a while
//! they are "pending": out of the trie but still holding a slot.

use crate::errors::Error;
use crate::node::Node;
use crossbeam_epoch::{self as epoch, Guard, Owned, Shared};
use log::{debug, trace};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Collector rounds run by a plain `flush`.
const FLUSH_ROUNDS: usize = 4;

/// Collector rounds tried while an insert waits for pending frees. Other
/// threads' short-lived pins can hold the epoch back for a round or two.
const RECLAIM_ROUNDS: usize = 64;

pub(crate) struct Reclaimer {
    capacity: usize,
    live: AtomicUsize,
    pending: Arc<AtomicUsize>,
}

impl Reclaimer {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity,
            live: AtomicUsize::new(0),
            pending: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    /// Nodes currently linked into a trie.
    pub(crate) fn live(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    /// Nodes unlinked but not yet freed.
    pub(crate) fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    pub(crate) fn available(&self) -> usize {
        self.capacity.saturating_sub(self.live() + self.pending())
    }

    /// Check that `needed` nodes can be allocated.
    ///
    /// Callers are pinned here, so this never waits on the collector: nodes
    /// retired by the calling thread cannot be freed until its guard drops.
    /// See [`flush_for`](Self::flush_for).
    pub(crate) fn reserve(&self, needed: usize) -> Result<(), Error> {
        let available = self.available();
        if available < needed {
            debug!(
                "[RECLAIM] capacity exhausted: need {}, have {} (live={}, pending={})",
                needed,
                available,
                self.live(),
                self.pending()
            );
            return Err(Error::OutOfMemory { needed, available });
        }
        Ok(())
    }

    /// Allocate a node. Callers `reserve` first.
    pub(crate) fn alloc<P>(&self, node: Node<P>) -> Owned<Node<P>> {
        self.live.fetch_add(1, Ordering::AcqRel);
        Owned::new(node)
    }

    /// Hand an unlinked node to the collector.
    ///
    /// # Safety
    /// `node` is no longer reachable from any trie, is retired at most once, and
    /// `P` outlives the deferred drop.
    pub(crate) unsafe fn retire<P>(&self, node: Shared<'_, Node<P>>, guard: &Guard) {
        self.live.fetch_sub(1, Ordering::AcqRel);
        self.pending.fetch_add(1, Ordering::AcqRel);
        let pending = Arc::clone(&self.pending);
        guard.defer_unchecked(move || {
            drop(node.into_owned());
            pending.fetch_sub(1, Ordering::AcqRel);
        });
    }

    /// Free an unlinked node right away.
    ///
    /// # Safety
    /// No reader can hold a reference to `node` (the table is exclusively borrowed).
    pub(crate) unsafe fn free_now<P>(&self, node: Shared<'_, Node<P>>) {
        self.live.fetch_sub(1, Ordering::AcqRel);
        drop(node.into_owned());
    }

    /// Push this thread's deferred frees to the collector and try to run them.
    pub(crate) fn flush(&self) {
        for _ in 0..FLUSH_ROUNDS {
            if self.pending() == 0 {
                break;
            }
            epoch::pin().flush();
        }
    }

    /// Run the collector until `needed` nodes are available. Returns false at
    /// once if pending frees could not cover the shortfall, or after a bounded
    /// number of rounds.
    ///
    /// The calling thread must not be pinned.
    pub(crate) fn flush_for(&self, needed: usize) -> bool {
        if self.available() + self.pending() < needed {
            return false;
        }
        for _ in 0..RECLAIM_ROUNDS {
            if self.available() >= needed {
                return true;
            }
            trace!("[RECLAIM] {} pending, flushing collector", self.pending());
            epoch::pin().flush();
            std::thread::yield_now();
        }
        self.available() >= needed
    }
}
