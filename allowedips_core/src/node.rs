//! Trie node.
//!
//! A node's prefix (`key`, `cidr`, `family`) never changes after the node is
//! allocated. Readers see only three mutable things: the two child links and the
//! owner, all published with release stores and loaded with acquire loads.
//! Everything else (parent slot, peer-list links) is touched only by the writer
//! that holds the table's writer lock.

use crate::helpers::{canonical, get_bit, key_to_ip};
use crate::types::Family;
use crossbeam_epoch::{Atomic, Guard, Shared};
use ipnet::IpNet;
use std::cell::UnsafeCell;
use std::mem::ManuallyDrop;
use std::net::IpAddr;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::{Arc, Weak};

/// Which child slot a node occupies under its parent.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum Slot {
    Left = 0,
    Right = 1,
}

impl Slot {
    #[inline]
    pub(crate) fn from_bit(bit: u8) -> Self {
        if bit == 0 {
            Slot::Left
        } else {
            Slot::Right
        }
    }

    #[inline]
    pub(crate) fn other(self) -> Self {
        match self {
            Slot::Left => Slot::Right,
            Slot::Right => Slot::Left,
        }
    }
}

/// Where a node hangs: directly off its family's root, or in a parent's slot.
pub(crate) enum Parent<P> {
    Root,
    Node { node: *const Node<P>, slot: Slot },
}

impl<P> Clone for Parent<P> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<P> Copy for Parent<P> {}

/// Fields owned by the writer.
struct WriterLinks<P> {
    parent: Parent<P>,
    peer_prev: *const Node<P>,
    peer_next: *const Node<P>,
}

pub(crate) struct Node<P> {
    /// Raw `Weak<P>` (from `Weak::into_raw`), null for glue nodes.
    owner: AtomicPtr<P>,
    children: [Atomic<Node<P>>; 2],
    key: u128,
    cidr: u8,
    family: Family,
    links: UnsafeCell<WriterLinks<P>>,
}

// SAFETY: the only non-thread-safe state is `links`, which is read and written
// exclusively under the table's writer lock. The owner is a `Weak<P>`, so
// sharing the node across threads needs `P: Send + Sync` just like `Weak<P>`.
unsafe impl<P: Send + Sync> Send for Node<P> {}
unsafe impl<P: Send + Sync> Sync for Node<P> {}

impl<P> Node<P> {
    /// Build an unlinked node. Host bits past `cidr` are cleared.
    pub(crate) fn new(family: Family, key: u128, cidr: u8, owner: Option<&Arc<P>>) -> Self {
        debug_assert!(cidr <= family.bits());
        Self {
            owner: AtomicPtr::new(owner.map_or(ptr::null_mut(), raw_weak)),
            children: [Atomic::null(), Atomic::null()],
            key: canonical(key, cidr),
            cidr,
            family,
            links: UnsafeCell::new(WriterLinks {
                parent: Parent::Root,
                peer_prev: ptr::null(),
                peer_next: ptr::null(),
            }),
        }
    }

    #[inline]
    pub(crate) fn key(&self) -> u128 {
        self.key
    }

    #[inline]
    pub(crate) fn cidr(&self) -> u8 {
        self.cidr
    }

    #[inline]
    pub(crate) fn family(&self) -> Family {
        self.family
    }

    /// Child slot that `key` descends into below this node.
    #[inline]
    pub(crate) fn choose(&self, key: u128) -> Slot {
        debug_assert!(self.cidr < self.family.bits());
        Slot::from_bit(get_bit(key, self.cidr))
    }

    #[inline]
    pub(crate) fn child<'g>(&self, slot: Slot, guard: &'g Guard) -> Shared<'g, Node<P>> {
        self.children[slot as usize].load(Ordering::Acquire, guard)
    }

    /// Publish `child` in `slot`. The child must be fully initialised.
    #[inline]
    pub(crate) fn set_child(&self, slot: Slot, child: Shared<'_, Node<P>>) {
        self.children[slot as usize].store(child, Ordering::Release);
    }

    /// The prefix this node stores (`trie_read_node`).
    pub(crate) fn read(&self) -> (IpAddr, u8) {
        (key_to_ip(self.family, self.key), self.cidr)
    }

    pub(crate) fn network(&self) -> Option<IpNet> {
        let (addr, cidr) = self.read();
        IpNet::new(addr, cidr).ok()
    }

    // ---- owner ----------------------------------------------------------

    /// Address of the owning peer, or null for glue. Doubles as the peer's identity.
    #[inline]
    pub(crate) fn owner_ptr(&self) -> *const P {
        self.owner.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn has_owner(&self) -> bool {
        !self.owner_ptr().is_null()
    }

    #[inline]
    pub(crate) fn is_owned_by(&self, peer: &Arc<P>) -> bool {
        ptr::eq(self.owner_ptr(), Arc::as_ptr(peer))
    }

    /// True if the node has an owner that still has strong references.
    #[inline]
    pub(crate) fn owner_alive(&self, _guard: &Guard) -> bool {
        let raw = self.owner_ptr();
        if raw.is_null() {
            return false;
        }
        // SAFETY: a non-null owner is a weak count held by this node; replaced
        // owners are released only after a grace period, and we are pinned.
        let weak = ManuallyDrop::new(unsafe { Weak::from_raw(raw) });
        weak.strong_count() > 0
    }

    pub(crate) fn upgrade_owner(&self, _guard: &Guard) -> Option<Arc<P>> {
        let raw = self.owner_ptr();
        if raw.is_null() {
            return None;
        }
        // SAFETY: see `owner_alive`.
        let weak = ManuallyDrop::new(unsafe { Weak::from_raw(raw) });
        weak.upgrade()
    }

    /// Swap the owner. The previous weak reference is dropped after a grace period.
    ///
    /// # Safety
    /// Caller holds the writer lock and `P` outlives every pending deferred function.
    pub(crate) unsafe fn set_owner(&self, peer: Option<&Arc<P>>, guard: &Guard) {
        let new = peer.map_or(ptr::null_mut(), raw_weak);
        let old = self.owner.swap(new, Ordering::AcqRel);
        if !old.is_null() {
            guard.defer_unchecked(move || drop(Weak::from_raw(old as *const P)));
        }
    }

    // ---- writer-only links ------------------------------------------------
    //
    // SAFETY (all of the below): caller holds the writer lock.

    #[inline]
    pub(crate) unsafe fn parent(&self) -> Parent<P> {
        (*self.links.get()).parent
    }

    #[inline]
    pub(crate) unsafe fn set_parent(&self, parent: Parent<P>) {
        (*self.links.get()).parent = parent;
    }

    #[inline]
    pub(crate) unsafe fn peer_prev(&self) -> *const Node<P> {
        (*self.links.get()).peer_prev
    }

    #[inline]
    pub(crate) unsafe fn peer_next(&self) -> *const Node<P> {
        (*self.links.get()).peer_next
    }

    #[inline]
    pub(crate) unsafe fn set_peer_links(&self, prev: *const Node<P>, next: *const Node<P>) {
        let links = &mut *self.links.get();
        links.peer_prev = prev;
        links.peer_next = next;
    }

    #[inline]
    pub(crate) unsafe fn set_peer_prev(&self, prev: *const Node<P>) {
        (*self.links.get()).peer_prev = prev;
    }

    #[inline]
    pub(crate) unsafe fn set_peer_next(&self, next: *const Node<P>) {
        (*self.links.get()).peer_next = next;
    }
}

impl<P> Drop for Node<P> {
    fn drop(&mut self) {
        let raw = *self.owner.get_mut();
        if !raw.is_null() {
            // SAFETY: the node still holds this weak count.
            drop(unsafe { Weak::from_raw(raw as *const P) });
        }
    }
}

#[inline]
fn raw_weak<P>(peer: &Arc<P>) -> *mut P {
    Weak::into_raw(Arc::downgrade(peer)) as *mut P
}
