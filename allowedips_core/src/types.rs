//! Public data types shared by the tries and the table.

use crate::constants::{DEFAULT_CAPACITY, V4_BITS, V6_BITS};
use ipnet::IpNet;
use std::sync::Arc;

/// Address family; each family has its own trie.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Family {
    V4,
    V6,
}

impl Family {
    /// Width of an address of this family, in bits.
    #[inline]
    pub const fn bits(self) -> u8 {
        match self {
            Family::V4 => V4_BITS,
            Family::V6 => V6_BITS,
        }
    }
}

/// Result of a longest-prefix match: the owning peer and the prefix that matched.
#[derive(Debug)]
pub struct Match<P> {
    pub network: IpNet,
    pub peer: Arc<P>,
}

/// Every live binding, with each family's mutation counter as read before the
/// walk started. If either counter has moved since, the dump may mix old and
/// new state.
#[derive(Debug)]
pub struct Dump<P> {
    pub v4_seq: u64,
    pub v6_seq: u64,
    pub entries: Vec<(IpNet, Arc<P>)>,
}

/// Table configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Upper bound on nodes (owned and glue) that are linked or awaiting reclamation.
    pub capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
        }
    }
}

impl Config {
    pub fn with_capacity(capacity: usize) -> Self {
        Self { capacity }
    }
}
