//! Constants and configuration for the allowed-IP tries

/// Significant bits in an IPv4 key.
pub const V4_BITS: u8 = 32;
/// Significant bits in an IPv6 key.
pub const V6_BITS: u8 = 128;

/// Node budget used when no `Config` is supplied.
pub const DEFAULT_CAPACITY: usize = 1_048_576;

/// Worst case of nodes a single insert can allocate (new leaf + glue).
pub const MAX_NODES_PER_INSERT: usize = 2;

pub const METRIC_INSERTS: &str = "allowedips_inserts_total";
pub const METRIC_INSERT_REJECTED: &str = "allowedips_insert_rejected_total";
pub const METRIC_REMOVALS: &str = "allowedips_removals_total";
pub const METRIC_PEER_TEARDOWNS: &str = "allowedips_peer_teardowns_total";
pub const METRIC_FREE_SLOTS: &str = "allowedips_free_slots";
