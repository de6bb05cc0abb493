//! Per-peer intrusive lists of owned nodes.
//!
//! The `prev`/`next` links live inside each `Node`; only the heads are kept here,
//! keyed by the address of the peer's `Arc` allocation. While a peer has a list
//! entry, at least one node holds a `Weak` to it, so that address cannot be
//! handed to another peer. A peer's list spans both address families.
//!
//! Everything in this module runs under the table's writer lock.

use crate::node::Node;
use std::collections::HashMap;
use std::ptr;
use std::sync::Arc;

/// Identity of a peer: the address of its `Arc` payload.
pub(crate) type PeerKey = usize;

#[inline]
pub(crate) fn peer_key<P>(peer: &Arc<P>) -> PeerKey {
    Arc::as_ptr(peer) as usize
}

#[inline]
pub(crate) fn owner_key<P>(node: &Node<P>) -> Option<PeerKey> {
    let raw = node.owner_ptr();
    (!raw.is_null()).then_some(raw as usize)
}

struct ListHead<P> {
    head: *const Node<P>,
    tail: *const Node<P>,
    len: usize,
}

pub(crate) struct PeerLists<P> {
    heads: HashMap<PeerKey, ListHead<P>>,
}

// SAFETY: the raw node pointers are only dereferenced by the writer holding the
// mutex this value lives in; nodes themselves are `Send + Sync` for such `P`.
unsafe impl<P: Send + Sync> Send for PeerLists<P> {}

impl<P> PeerLists<P> {
    pub(crate) fn new() -> Self {
        Self {
            heads: HashMap::new(),
        }
    }

    /// Number of nodes owned by `peer`.
    pub(crate) fn len(&self, peer: PeerKey) -> usize {
        self.heads.get(&peer).map_or(0, |h| h.len)
    }

    /// Number of peers with at least one node.
    pub(crate) fn peers(&self) -> usize {
        self.heads.len()
    }

    /// Append `node` to `peer`'s list.
    ///
    /// # Safety
    /// `node` is live and not currently on any list.
    pub(crate) unsafe fn push_back(&mut self, peer: PeerKey, node: *const Node<P>) {
        let head = self.heads.entry(peer).or_insert(ListHead {
            head: ptr::null(),
            tail: ptr::null(),
            len: 0,
        });
        (*node).set_peer_links(head.tail, ptr::null());
        if head.tail.is_null() {
            head.head = node;
        } else {
            (*head.tail).set_peer_next(node);
        }
        head.tail = node;
        head.len += 1;
    }

    /// Remove `node` from `peer`'s list. Drops the head once the list is empty.
    ///
    /// # Safety
    /// `node` is live and currently on `peer`'s list.
    pub(crate) unsafe fn unlink(&mut self, peer: PeerKey, node: *const Node<P>) {
        let Some(head) = self.heads.get_mut(&peer) else {
            debug_assert!(false, "unlink from a peer without a list");
            return;
        };
        let prev = (*node).peer_prev();
        let next = (*node).peer_next();
        if prev.is_null() {
            head.head = next;
        } else {
            (*prev).set_peer_next(next);
        }
        if next.is_null() {
            head.tail = prev;
        } else {
            (*next).set_peer_prev(prev);
        }
        (*node).set_peer_links(ptr::null(), ptr::null());
        head.len -= 1;
        if head.len == 0 {
            self.heads.remove(&peer);
        }
    }

    /// Move `node` from `from`'s list to the tail of `to`'s.
    ///
    /// # Safety
    /// As for `unlink` and `push_back`.
    pub(crate) unsafe fn move_to(&mut self, from: PeerKey, to: PeerKey, node: *const Node<P>) {
        self.unlink(from, node);
        self.push_back(to, node);
    }

    /// Detach `peer`'s whole list and return its first node (null if none).
    /// The caller walks it with `peer_next` and must not push onto it again.
    pub(crate) fn take(&mut self, peer: PeerKey) -> *const Node<P> {
        self.heads.remove(&peer).map_or(ptr::null(), |h| h.head)
    }

    /// Visit `peer`'s nodes in insertion order.
    ///
    /// # Safety
    /// Every node on the list is live.
    pub(crate) unsafe fn for_each(&self, peer: PeerKey, mut f: impl FnMut(&Node<P>)) {
        let mut cur = self.heads.get(&peer).map_or(ptr::null(), |h| h.head);
        while let Some(node) = cur.as_ref() {
            f(node);
            cur = node.peer_next();
        }
    }

    pub(crate) fn clear(&mut self) {
        self.heads.clear();
    }
}
