//! Allowed-IP routing table.
//!
//! Maps IPv4 and IPv6 addresses to the peer owning the longest matching
//! prefix. Lookups are lock-free and allocation-free: readers pin a
//! `crossbeam-epoch` guard, and writers (serialized by the table's own mutex)
//! publish every structural change with a single release store. Unlinked nodes
//! are freed only after every reader that could still see them has unpinned.
//!
//! ```
//! use allowedips_core::AllowedIps;
//! use std::net::Ipv4Addr;
//! use std::sync::Arc;
//!
//! let table = AllowedIps::new();
//! let peer = Arc::new("peer-a");
//! table.insert_v4(&peer, Ipv4Addr::new(10, 0, 0, 0), 8).unwrap();
//! assert_eq!(table.lookup_v4(Ipv4Addr::new(10, 1, 2, 3)).as_deref(), Some(&"peer-a"));
//! ```
//!
//! A C ABI over `u64` handles and peer ids lives in [`public_api`].

pub mod constants;
pub mod errors;
pub mod handle_registry;
pub mod helpers;
pub mod packet;
pub mod public_api;
pub mod telemetry;
pub mod types;

mod node;
mod peer_list;
mod reclaim;
mod table;
mod trie;

pub use errors::{Error, ErrorCode};
pub use table::{AllowedIps, AllowedIpsWriter};
pub use types::{Config, Dump, Family, Match};
