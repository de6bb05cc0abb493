//! One address family's binary radix trie.
//!
//! Readers (`find`) never lock: they pin an epoch guard, follow acquire-loaded
//! child pointers and may race with a writer. Writers (everything taking
//! `&mut PeerLists`) are serialized by the table's writer lock; owning the
//! `&mut PeerLists` is the proof of that. A writer never changes a node that a
//! reader may be inside except through one atomic store: a child slot, the root,
//! or the owner. New nodes are fully built (children included) before the store
//! that makes them reachable.

use crate::constants::MAX_NODES_PER_INSERT;
use crate::errors::Error;
use crate::helpers::{canonical, common_prefix_len, prefix_matches};
use crate::node::{Node, Parent, Slot};
use crate::peer_list::{owner_key, peer_key, PeerLists};
use crate::reclaim::Reclaimer;
use crate::types::Family;
use crossbeam_epoch::{Atomic, Guard, Shared};
use log::trace;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Outcome of a successful insert.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum Inserted {
    /// A new node was linked (possibly with a glue node above it).
    New,
    /// A glue node already sat at this prefix and now belongs to the peer.
    Claimed,
    /// The prefix moved over from another peer.
    Reassigned,
    /// The peer already owned exactly this prefix.
    Unchanged,
}

enum Placement<'g, P> {
    Exact(&'g Node<P>),
    Below(Option<&'g Node<P>>),
}

pub(crate) struct Trie<P> {
    family: Family,
    root: Atomic<Node<P>>,
    seq: AtomicU64,
}

impl<P> Trie<P> {
    pub(crate) fn new(family: Family) -> Self {
        Self {
            family,
            root: Atomic::null(),
            seq: AtomicU64::new(0),
        }
    }

    /// Mutation counter; changes whenever the trie's contents may have changed.
    pub(crate) fn seq(&self) -> u64 {
        self.seq.load(Ordering::Acquire)
    }

    #[inline]
    fn bump_seq(&self) {
        self.seq.fetch_add(1, Ordering::Release);
    }

    // ---- read side -----------------------------------------------------------

    /// Deepest node on `key`'s path whose owner is still alive.
    fn find<'g>(&self, key: u128, guard: &'g Guard) -> Option<&'g Node<P>> {
        let bits = self.family.bits();
        let mut found = None;
        let mut cur = self.root.load(Ordering::Acquire, guard);
        // SAFETY: nodes reachable under a pinned guard are freed only after it drops.
        while let Some(node) = unsafe { cur.as_ref() } {
            if !prefix_matches(node.key(), node.cidr(), key) {
                break;
            }
            if node.owner_alive(guard) {
                found = Some(node);
            }
            if node.cidr() == bits {
                break;
            }
            cur = node.child(node.choose(key), guard);
        }
        found
    }

    /// Longest-prefix match for `key`: the owning peer and the matching node.
    pub(crate) fn lookup<'g>(&self, key: u128, guard: &'g Guard) -> Option<(Arc<P>, &'g Node<P>)> {
        loop {
            let node = self.find(key, guard)?;
            if let Some(peer) = node.upgrade_owner(guard) {
                #[cfg(feature = "trace")]
                trace!("[LOOKUP] {:x} -> /{}", key, node.cidr());
                return Some((peer, node));
            }
            // The owner died between the liveness check and the upgrade, or was
            // swapped out; walk again and settle on what is there now.
        }
    }

    /// Visit every owned node in address order (shorter prefixes first).
    pub(crate) fn walk<'g>(&self, guard: &'g Guard, mut f: impl FnMut(&'g Node<P>))
    where
        P: 'g,
    {
        let mut stack = Vec::with_capacity(64);
        let root = self.root.load(Ordering::Acquire, guard);
        if !root.is_null() {
            stack.push(root);
        }
        while let Some(cur) = stack.pop() {
            // SAFETY: as in `find`.
            let node = unsafe { cur.deref() };
            if node.has_owner() {
                f(node);
            }
            if node.cidr() < self.family.bits() {
                for slot in [Slot::Right, Slot::Left] {
                    let child = node.child(slot, guard);
                    if !child.is_null() {
                        stack.push(child);
                    }
                }
            }
        }
    }

    // ---- write side ----------------------------------------------------------

    /// Walk down as an insert would, stopping at the exact node for `key/cidr`
    /// or below the deepest node whose prefix covers it.
    fn placement<'g>(&self, key: u128, cidr: u8, guard: &'g Guard) -> Placement<'g, P> {
        let mut parent = None;
        let mut cur = self.root.load(Ordering::Acquire, guard);
        // SAFETY: the writer lock keeps nodes from being unlinked under us.
        while let Some(node) = unsafe { cur.as_ref() } {
            if node.cidr() > cidr || !prefix_matches(node.key(), node.cidr(), key) {
                break;
            }
            if node.cidr() == cidr {
                return Placement::Exact(node);
            }
            parent = Some(node);
            cur = node.child(node.choose(key), guard);
        }
        Placement::Below(parent)
    }

    /// Publish `node` at `at` (root or a parent's slot) and record the back-link.
    ///
    /// # Safety
    /// Writer lock held; `node` is null or live.
    unsafe fn connect(&self, at: Parent<P>, node: Shared<'_, Node<P>>) {
        if let Some(n) = node.as_ref() {
            n.set_parent(at);
        }
        match at {
            Parent::Root => self.root.store(node, Ordering::Release),
            Parent::Node { node: parent, slot } => (*parent).set_child(slot, node),
        }
    }

    /// Insert `key/cidr` for `peer`, or claim the existing node for it.
    pub(crate) fn insert(
        &self,
        lists: &mut PeerLists<P>,
        reclaim: &Reclaimer,
        peer: &Arc<P>,
        key: u128,
        cidr: u8,
        guard: &Guard,
    ) -> Result<Inserted, Error>
    where
        P: Send + Sync + 'static,
    {
        let bits = self.family.bits();
        if cidr > bits {
            return Err(Error::InvalidCidr { cidr, max: bits });
        }
        let key = canonical(key, cidr);
        let pk = peer_key(peer);

        let parent = match self.placement(key, cidr, guard) {
            Placement::Below(parent) => parent,
            Placement::Exact(node) if node.is_owned_by(peer) => return Ok(Inserted::Unchanged),
            Placement::Exact(node) => {
                // SAFETY: writer lock held; `node` is live and on its owner's list, if any.
                let outcome = unsafe {
                    let outcome = match owner_key(node) {
                        Some(old) => {
                            lists.move_to(old, pk, node);
                            Inserted::Reassigned
                        }
                        None => {
                            lists.push_back(pk, node);
                            Inserted::Claimed
                        }
                    };
                    node.set_owner(Some(peer), guard);
                    outcome
                };
                self.bump_seq();
                trace!("[INSERT] {:?} existing /{} node", outcome, cidr);
                return Ok(outcome);
            }
        };

        // Where the new subtree will hang, and what currently hangs there.
        let (at, down) = match parent {
            None => (Parent::Root, self.root.load(Ordering::Acquire, guard)),
            Some(p) => {
                let slot = p.choose(key);
                (Parent::Node { node: p as *const _, slot }, p.child(slot, guard))
            }
        };

        // SAFETY: writer lock held.
        let Some(down_ref) = (unsafe { down.as_ref() }) else {
            reclaim.reserve(1)?;
            let leaf = reclaim.alloc(Node::new(self.family, key, cidr, Some(peer))).into_shared(guard);
            unsafe {
                lists.push_back(pk, leaf.as_raw());
                self.connect(at, leaf);
            }
            self.bump_seq();
            trace!("[INSERT] new leaf /{} in empty slot", cidr);
            return Ok(Inserted::New);
        };

        let split = common_prefix_len(down_ref.key(), key, cidr.min(down_ref.cidr()));

        if split == cidr {
            // The new prefix covers `down`: it becomes `down`'s parent.
            reclaim.reserve(1)?;
            let node = Node::new(self.family, key, cidr, Some(peer));
            let slot = node.choose(down_ref.key());
            let node = reclaim.alloc(node).into_shared(guard);
            unsafe {
                let n = node.deref();
                self.connect(Parent::Node { node: n, slot }, down);
                lists.push_back(pk, n);
                self.connect(at, node);
            }
            self.bump_seq();
            trace!("[INSERT] new /{} above existing /{}", cidr, down_ref.cidr());
            return Ok(Inserted::New);
        }

        // Diverges partway: a glue node at the split forks `down` and the new leaf.
        reclaim.reserve(MAX_NODES_PER_INSERT)?;
        let leaf = reclaim.alloc(Node::new(self.family, key, cidr, Some(peer))).into_shared(guard);
        let glue = Node::new(self.family, key, split, None);
        let down_slot = glue.choose(down_ref.key());
        let leaf_slot = glue.choose(key);
        debug_assert_ne!(down_slot, leaf_slot);
        let glue = reclaim.alloc(glue).into_shared(guard);
        unsafe {
            let g = glue.deref();
            self.connect(Parent::Node { node: g, slot: down_slot }, down);
            self.connect(Parent::Node { node: g, slot: leaf_slot }, leaf);
            lists.push_back(pk, leaf.as_raw());
            self.connect(at, glue);
        }
        self.bump_seq();
        trace!("[INSERT] glue /{} forks /{} and new /{}", split, down_ref.cidr(), cidr);
        Ok(Inserted::New)
    }

    /// The node storing exactly `key/cidr`, if any.
    pub(crate) fn exact<'g>(&self, key: u128, cidr: u8, guard: &'g Guard) -> Option<&'g Node<P>> {
        if cidr > self.family.bits() {
            return None;
        }
        match self.placement(canonical(key, cidr), cidr, guard) {
            Placement::Exact(node) => Some(node),
            Placement::Below(_) => None,
        }
    }

    /// Drop `node`'s ownership and unlink it if it no longer needs to branch.
    ///
    /// A node with two children stays as glue. Otherwise its only child (or
    /// nothing) takes its place, and if that leaves a glue parent with a single
    /// child, the parent is replaced by that child too.
    ///
    /// # Safety
    /// Writer lock held; `node` is live, belongs to this trie and has already
    /// been taken off its peer list.
    pub(crate) unsafe fn remove_node(&self, node: &Node<P>, reclaim: &Reclaimer, guard: &Guard)
    where
        P: Send + Sync + 'static,
    {
        node.set_owner(None, guard);
        self.bump_seq();

        let left = node.child(Slot::Left, guard);
        let right = node.child(Slot::Right, guard);
        if !left.is_null() && !right.is_null() {
            return;
        }
        let child = if left.is_null() { right } else { left };
        let at = node.parent();
        self.connect(at, child);

        let collapse = match at {
            Parent::Node { node: parent, slot } if child.is_null() && !(*parent).has_owner() => {
                Some((parent, slot))
            }
            _ => None,
        };
        reclaim.retire(Shared::from(node as *const Node<P>), guard);

        if let Some((parent, slot)) = collapse {
            let parent = &*parent;
            let sibling = parent.child(slot.other(), guard);
            self.connect(parent.parent(), sibling);
            reclaim.retire(Shared::from(parent as *const Node<P>), guard);
        }
    }

    /// Detach the whole trie and hand every node to the collector.
    ///
    /// # Safety
    /// Writer lock held; caller forgets every peer list entry for this trie.
    pub(crate) unsafe fn clear(&self, reclaim: &Reclaimer, guard: &Guard) -> usize
    where
        P: Send + Sync + 'static,
    {
        let root = self.root.swap(Shared::null(), Ordering::AcqRel, guard);
        self.bump_seq();
        let mut retired = 0;
        let mut stack = vec![root];
        while let Some(cur) = stack.pop() {
            let Some(node) = cur.as_ref() else { continue };
            stack.push(node.child(Slot::Left, guard));
            stack.push(node.child(Slot::Right, guard));
            reclaim.retire(cur, guard);
            retired += 1;
        }
        retired
    }

    /// Free every node now. Only for teardown, when no reader can exist.
    pub(crate) fn destroy(&mut self, reclaim: &Reclaimer) {
        // SAFETY: `&mut self` excludes readers and writers alike.
        unsafe {
            let guard = crossbeam_epoch::unprotected();
            let mut stack = vec![self.root.swap(Shared::null(), Ordering::Relaxed, guard)];
            while let Some(cur) = stack.pop() {
                let Some(node) = cur.as_ref() else { continue };
                stack.push(node.child(Slot::Left, guard));
                stack.push(node.child(Slot::Right, guard));
                reclaim.free_now(cur);
            }
        }
    }
}
