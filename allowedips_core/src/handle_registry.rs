use crate::errors::{Error, ErrorCode};
use crate::table::AllowedIps;
use crate::types::Config;
use dashmap::DashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

/// Handle ID type - safer than raw pointers
pub type HandleId = u64;

/// Caller-chosen peer identifier on the C side.
pub type PeerId = u64;

/// What a C caller's peer looks like inside the table.
#[derive(Debug, PartialEq, Eq)]
pub struct FfiPeer {
    pub id: PeerId,
}

/// A table opened through the C ABI, plus the `Arc`s that keep its peers alive.
pub struct FfiTable {
    pub table: AllowedIps<FfiPeer>,
    peers: DashMap<PeerId, Arc<FfiPeer>>,
}

impl FfiTable {
    fn new(config: Config) -> Self {
        Self {
            table: AllowedIps::with_config(config),
            peers: DashMap::new(),
        }
    }

    /// The peer for `id`, created on first use.
    fn peer(&self, id: PeerId) -> Arc<FfiPeer> {
        self.peers
            .entry(id)
            .or_insert_with(|| Arc::new(FfiPeer { id }))
            .clone()
    }

    /// The peer for `id` if it has been seen.
    pub fn existing_peer(&self, id: PeerId) -> Option<Arc<FfiPeer>> {
        self.peers.get(&id).map(|p| p.clone())
    }

    // The peer map is only changed under the table's writer lock, so a peer
    // cannot be forgotten between being looked up and getting a prefix.

    /// Bind `addr/cidr` to `id`, creating the peer on first use.
    pub fn insert(&self, id: PeerId, addr: IpAddr, cidr: u8) -> Result<(), Error> {
        let mut w = self.table.writer();
        w.insert(&self.peer(id), addr, cidr)
    }

    /// Remove `addr/cidr` if `id` owns exactly that prefix.
    pub fn remove(&self, id: PeerId, addr: IpAddr, cidr: u8) -> bool {
        let mut w = self.table.writer();
        self.existing_peer(id)
            .is_some_and(|p| w.remove(&p, addr, cidr))
    }

    /// Remove every prefix of `id` and release the peer.
    pub fn remove_peer(&self, id: PeerId) -> bool {
        let mut w = self.table.writer();
        match self.peers.remove(&id) {
            Some((_, peer)) => {
                w.remove_by_peer(&peer);
                true
            }
            None => false,
        }
    }

    /// Forget every peer along with the table's contents.
    pub fn clear(&self) {
        let mut w = self.table.writer();
        w.clear();
        self.peers.clear();
    }
}

/// Global handle registry for tables opened through the C ABI
struct HandleRegistry {
    handles: DashMap<HandleId, Arc<FfiTable>>,
    next_id: AtomicU64,
}

impl HandleRegistry {
    fn new() -> Self {
        Self {
            handles: DashMap::new(),
            next_id: AtomicU64::new(1), // Start from 1, reserve 0 for null/invalid
        }
    }

    fn register(&self, table: FfiTable) -> HandleId {
        let handle_id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.handles.insert(handle_id, Arc::new(table));
        handle_id
    }

    fn get(&self, handle_id: HandleId) -> Result<Arc<FfiTable>, ErrorCode> {
        if handle_id == 0 {
            return Err(ErrorCode::InvalidHandle);
        }
        self.handles
            .get(&handle_id)
            .map(|t| Arc::clone(&t))
            .ok_or(ErrorCode::InvalidHandle)
    }

    fn unregister(&self, handle_id: HandleId) -> Result<(), ErrorCode> {
        if handle_id == 0 {
            return Err(ErrorCode::InvalidHandle);
        }
        self.handles
            .remove(&handle_id)
            .map(|_| ())
            .ok_or(ErrorCode::InvalidHandle)
    }
}

static REGISTRY: OnceLock<HandleRegistry> = OnceLock::new();

fn get_registry() -> &'static HandleRegistry {
    REGISTRY.get_or_init(HandleRegistry::new)
}

/// Create a table and return its handle ID
pub fn register_handle(config: Config) -> HandleId {
    get_registry().register(FfiTable::new(config))
}

/// Run `f` against the table identified by `handle_id`.
///
/// The registry lock is not held while `f` runs; a concurrent close only drops
/// the registry's reference, so the table outlives the call.
pub fn with_handle<T, F>(handle_id: HandleId, f: F) -> Result<T, ErrorCode>
where
    F: FnOnce(&FfiTable) -> T,
{
    let table = get_registry().get(handle_id)?;
    Ok(f(&table))
}

/// Unregister a table; it is dropped once no call is still using it.
pub fn unregister_handle(handle_id: HandleId) -> Result<(), ErrorCode> {
    get_registry().unregister(handle_id)
}
