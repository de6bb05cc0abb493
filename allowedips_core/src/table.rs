//! `AllowedIps`: the IPv4 and IPv6 tries behind one writer lock.
//!
//! Lookups and enumeration pin an epoch guard and never lock. Everything that
//! changes the tries goes through an [`AllowedIpsWriter`], which holds the
//! table's mutex for as long as it lives; the convenience methods on
//! `AllowedIps` take it for a single call.

use crate::constants::{
    METRIC_FREE_SLOTS, METRIC_INSERTS, METRIC_INSERT_REJECTED, METRIC_PEER_TEARDOWNS,
    METRIC_REMOVALS,
};
use crate::errors::Error;
use crate::helpers::{ip_key, key_from_bytes, key_to_ip, v4_key, v6_key};
use crate::packet;
use crate::peer_list::{peer_key, PeerLists};
use crate::reclaim::Reclaimer;
use crate::trie::{Inserted, Trie};
use crate::types::{Config, Dump, Family, Match};
use crossbeam_epoch as epoch;
use ipnet::IpNet;
use log::{debug, trace};
use metrics::{counter, gauge};
use once_cell::sync::OnceCell;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Longest-prefix-match table from IP addresses to peers.
///
/// Nodes hold only a `Weak<P>`; the caller keeps peers alive. A peer whose last
/// `Arc` is gone stops matching, and lookups fall back to the next less
/// specific prefix until its entries are removed with `remove_by_peer`.
pub struct AllowedIps<P> {
    v4: Trie<P>,
    v6: Trie<P>,
    reclaim: Reclaimer,
    entries: AtomicUsize,
    writer: Mutex<PeerLists<P>>,
}

/// Exclusive mutation access to an [`AllowedIps`] table.
pub struct AllowedIpsWriter<'a, P> {
    table: &'a AllowedIps<P>,
    lists: MutexGuard<'a, PeerLists<P>>,
}

impl<P> AllowedIps<P> {
    #[inline]
    fn trie(&self, family: Family) -> &Trie<P> {
        match family {
            Family::V4 => &self.v4,
            Family::V6 => &self.v6,
        }
    }

    fn ensure_logging() {
        static INIT: OnceCell<()> = OnceCell::new();
        INIT.get_or_init(|| {
            let _ = env_logger::builder()
                .format_timestamp(None)
                .is_test(std::env::var("RUST_TEST_THREADS").is_ok())
                .try_init();
        });
    }
}

impl<P: Send + Sync + 'static> Default for AllowedIps<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: Send + Sync + 'static> AllowedIps<P> {
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    pub fn with_config(config: Config) -> Self {
        Self::ensure_logging();
        debug!("[OPEN] allowed-ip table, capacity={}", config.capacity);
        Self {
            v4: Trie::new(Family::V4),
            v6: Trie::new(Family::V6),
            reclaim: Reclaimer::new(config.capacity),
            entries: AtomicUsize::new(0),
            writer: Mutex::new(PeerLists::new()),
        }
    }

    /// Take the writer lock. Blocks while another writer holds it.
    pub fn writer(&self) -> AllowedIpsWriter<'_, P> {
        AllowedIpsWriter {
            table: self,
            lists: self.writer.lock().unwrap_or_else(PoisonError::into_inner),
        }
    }

    // ---- mutation (locks per call) ----------------------------------------

    pub fn insert(&self, peer: &Arc<P>, addr: IpAddr, cidr: u8) -> Result<(), Error> {
        self.writer().insert(peer, addr, cidr)
    }

    pub fn insert_v4(&self, peer: &Arc<P>, addr: Ipv4Addr, cidr: u8) -> Result<(), Error> {
        self.writer().insert_v4(peer, addr, cidr)
    }

    pub fn insert_v6(&self, peer: &Arc<P>, addr: Ipv6Addr, cidr: u8) -> Result<(), Error> {
        self.writer().insert_v6(peer, addr, cidr)
    }

    pub fn insert_net(&self, peer: &Arc<P>, net: IpNet) -> Result<(), Error> {
        self.writer().insert_net(peer, net)
    }

    pub fn insert_bytes(&self, peer: &Arc<P>, addr: &[u8], cidr: u8) -> Result<(), Error> {
        self.writer().insert_bytes(peer, addr, cidr)
    }

    pub fn remove(&self, peer: &Arc<P>, addr: IpAddr, cidr: u8) -> bool {
        self.writer().remove(peer, addr, cidr)
    }

    pub fn remove_by_peer(&self, peer: &Arc<P>) {
        self.writer().remove_by_peer(peer)
    }

    pub fn clear(&self) {
        self.writer().clear()
    }

    pub fn allowed_ips(&self, peer: &Arc<P>) -> Vec<IpNet> {
        self.writer().allowed_ips(peer)
    }

    // ---- lookup (lock-free) -----------------------------------------------

    #[inline]
    fn lookup_key(&self, family: Family, key: u128) -> Option<Arc<P>> {
        let guard = &epoch::pin();
        self.trie(family).lookup(key, guard).map(|(peer, _)| peer)
    }

    /// Peer owning the most specific prefix that contains `addr`.
    pub fn lookup(&self, addr: IpAddr) -> Option<Arc<P>> {
        let (family, key) = ip_key(addr);
        self.lookup_key(family, key)
    }

    pub fn lookup_v4(&self, addr: Ipv4Addr) -> Option<Arc<P>> {
        self.lookup_key(Family::V4, v4_key(u32::from(addr)))
    }

    pub fn lookup_v6(&self, addr: Ipv6Addr) -> Option<Arc<P>> {
        self.lookup_key(Family::V6, v6_key(addr))
    }

    /// Look up a raw address: 4 bytes for IPv4, 16 for IPv6.
    pub fn lookup_bytes(&self, addr: &[u8]) -> Result<Option<Arc<P>>, Error> {
        let (family, key) = key_from_bytes(addr)?;
        Ok(self.lookup_key(family, key))
    }

    /// Like [`lookup`](Self::lookup), also reporting which prefix matched.
    pub fn longest_match(&self, addr: IpAddr) -> Option<Match<P>> {
        let (family, key) = ip_key(addr);
        let guard = &epoch::pin();
        let (peer, node) = self.trie(family).lookup(key, guard)?;
        let network = node.network()?;
        Some(Match { network, peer })
    }

    /// Peer a packet should be sent to, by its destination address.
    pub fn lookup_dst(&self, packet: &[u8]) -> Option<Arc<P>> {
        packet::destination(packet).and_then(|addr| self.lookup(addr))
    }

    /// Peer a received packet's source address is allowed for.
    pub fn lookup_src(&self, packet: &[u8]) -> Option<Arc<P>> {
        packet::source(packet).and_then(|addr| self.lookup(addr))
    }

    // ---- enumeration and state ----------------------------------------------

    /// Every live binding, IPv4 first, each family in address order, tagged
    /// with the `seq` of both families so the caller can tell whether the walk
    /// raced with a writer (see [`is_current`](Self::is_current)).
    pub fn dump(&self) -> Dump<P> {
        let v4_seq = self.v4.seq();
        let v6_seq = self.v6.seq();
        let guard = &epoch::pin();
        let mut entries = Vec::with_capacity(self.len());
        for trie in [&self.v4, &self.v6] {
            trie.walk(guard, |node| {
                if let (Some(net), Some(peer)) = (node.network(), node.upgrade_owner(guard)) {
                    entries.push((net, peer));
                }
            });
        }
        Dump { v4_seq, v6_seq, entries }
    }

    /// True if neither trie has changed since `dump` was taken.
    pub fn is_current(&self, dump: &Dump<P>) -> bool {
        self.v4.seq() == dump.v4_seq && self.v6.seq() == dump.v6_seq
    }

    pub fn entries(&self) -> Vec<(IpNet, Arc<P>)> {
        self.dump().entries
    }

    /// Number of prefixes bound to a peer (including peers that have since died
    /// but were not yet removed).
    pub fn len(&self) -> usize {
        self.entries.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Mutation counter of one family's trie.
    pub fn seq(&self, family: Family) -> u64 {
        self.trie(family).seq()
    }

    pub fn capacity(&self) -> usize {
        self.reclaim.capacity()
    }

    /// Nodes that can still be allocated without waiting for reclamation.
    pub fn available_capacity(&self) -> usize {
        self.reclaim.available()
    }

    pub fn report_capacity_metrics(&self) {
        let free = self.available_capacity() as f64;
        gauge!(METRIC_FREE_SLOTS).set(free);
    }

    /// Try to run pending frees now (synchronization point for reclamation).
    pub fn flush(&self) {
        self.reclaim.flush();
        trace!(
            "[FLUSH] live={} pending={}",
            self.reclaim.live(),
            self.reclaim.pending()
        );
    }
}

impl<P> Drop for AllowedIps<P> {
    fn drop(&mut self) {
        self.v4.destroy(&self.reclaim);
        self.v6.destroy(&self.reclaim);
    }
}

impl<'a, P: Send + Sync + 'static> AllowedIpsWriter<'a, P> {
    pub fn insert(&mut self, peer: &Arc<P>, addr: IpAddr, cidr: u8) -> Result<(), Error> {
        let (family, key) = ip_key(addr);
        self.insert_key(peer, family, key, cidr)
    }

    pub fn insert_v4(&mut self, peer: &Arc<P>, addr: Ipv4Addr, cidr: u8) -> Result<(), Error> {
        self.insert_key(peer, Family::V4, v4_key(u32::from(addr)), cidr)
    }

    pub fn insert_v6(&mut self, peer: &Arc<P>, addr: Ipv6Addr, cidr: u8) -> Result<(), Error> {
        self.insert_key(peer, Family::V6, v6_key(addr), cidr)
    }

    pub fn insert_net(&mut self, peer: &Arc<P>, net: IpNet) -> Result<(), Error> {
        self.insert(peer, net.addr(), net.prefix_len())
    }

    pub fn insert_bytes(&mut self, peer: &Arc<P>, addr: &[u8], cidr: u8) -> Result<(), Error> {
        let (family, key) = key_from_bytes(addr)?;
        self.insert_key(peer, family, key, cidr)
    }

    fn try_insert(&mut self, peer: &Arc<P>, family: Family, key: u128, cidr: u8) -> Result<Inserted, Error> {
        let table = self.table;
        let guard = &epoch::pin();
        table
            .trie(family)
            .insert(&mut self.lists, &table.reclaim, peer, key, cidr, guard)
    }

    fn insert_key(&mut self, peer: &Arc<P>, family: Family, key: u128, cidr: u8) -> Result<(), Error> {
        let table = self.table;
        let mut result = self.try_insert(peer, family, key, cidr);
        // Nodes this thread retired can only be freed once its pin is released.
        if let Err(Error::OutOfMemory { needed, .. }) = result {
            if table.reclaim.flush_for(needed) {
                result = self.try_insert(peer, family, key, cidr);
            }
        }
        match result {
            Ok(outcome) => {
                if matches!(outcome, Inserted::New | Inserted::Claimed) {
                    table.entries.fetch_add(1, Ordering::AcqRel);
                }
                if outcome != Inserted::Unchanged {
                    counter!(METRIC_INSERTS).increment(1);
                }
                debug!("[INSERT] {}/{} {:?}", key_to_ip(family, key), cidr, outcome);
                Ok(())
            }
            Err(e) => {
                counter!(METRIC_INSERT_REJECTED).increment(1);
                debug!("[INSERT] {}/{} rejected: {}", key_to_ip(family, key), cidr, e);
                Err(e)
            }
        }
    }

    /// Remove `addr/cidr` if, and only if, `peer` owns exactly that prefix.
    pub fn remove(&mut self, peer: &Arc<P>, addr: IpAddr, cidr: u8) -> bool {
        let table = self.table;
        let (family, key) = ip_key(addr);
        let trie = table.trie(family);
        let guard = &epoch::pin();
        let Some(node) = trie.exact(key, cidr, guard) else {
            return false;
        };
        if !node.is_owned_by(peer) {
            return false;
        }
        // SAFETY: writer lock held; `node` is live and on `peer`'s list.
        unsafe {
            self.lists.unlink(peer_key(peer), node);
            trie.remove_node(node, &table.reclaim, guard);
        }
        table.entries.fetch_sub(1, Ordering::AcqRel);
        counter!(METRIC_REMOVALS).increment(1);
        debug!("[REMOVE] {}/{}", addr, cidr);
        true
    }

    /// Remove every prefix `peer` owns, in both families.
    pub fn remove_by_peer(&mut self, peer: &Arc<P>) {
        let table = self.table;
        let guard = &epoch::pin();
        let mut cur = self.lists.take(peer_key(peer));
        let mut removed = 0usize;
        // SAFETY: writer lock held; the detached list holds live nodes owned by
        // `peer`. The successor is read before its predecessor is unlinked, and
        // unlinking only ever retires the node itself or an unowned glue parent.
        unsafe {
            while let Some(node) = cur.as_ref() {
                cur = node.peer_next();
                table.trie(node.family()).remove_node(node, &table.reclaim, guard);
                removed += 1;
            }
        }
        if removed > 0 {
            table.entries.fetch_sub(removed, Ordering::AcqRel);
            counter!(METRIC_REMOVALS).increment(removed as u64);
            counter!(METRIC_PEER_TEARDOWNS).increment(1);
        }
        debug!(
            "[REMOVE_BY_PEER] removed {} prefix(es), {} peer(s) left",
            removed,
            self.lists.peers()
        );
    }

    /// Drop every binding. Nodes are freed once no reader can see them.
    pub fn clear(&mut self) {
        let table = self.table;
        let guard = &epoch::pin();
        // SAFETY: writer lock held; the lists are forgotten right after.
        let retired = unsafe {
            table.v4.clear(&table.reclaim, guard) + table.v6.clear(&table.reclaim, guard)
        };
        self.lists.clear();
        table.entries.store(0, Ordering::Release);
        debug!("[CLEAR] retired {} node(s)", retired);
    }

    /// Prefixes owned by `peer`, in the order they were bound to it.
    pub fn allowed_ips(&self, peer: &Arc<P>) -> Vec<IpNet> {
        let pk = peer_key(peer);
        let mut out = Vec::with_capacity(self.lists.len(pk));
        // SAFETY: writer lock held, so every listed node is linked and live.
        unsafe { self.lists.for_each(pk, |node| out.extend(node.network())) };
        out
    }
}
