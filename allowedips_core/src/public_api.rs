//! `extern "C"` surface. Every call returns an `ErrorCode` and records it as the
//! thread's last error.

use crate::{
    errors::{record, ErrorCode},
    handle_registry::{self, HandleId, PeerId},
    telemetry,
    types::Config,
};
use ipnet::IpNet;
use std::{
    ffi::CStr,
    net::IpAddr,
    os::raw::c_char,
};

// ─────────────────────────── helpers ─────────────────────────────────── //

#[inline]
fn cstr<'a>(p: *const c_char) -> Result<&'a str, ErrorCode> {
    if p.is_null() {
        return Err(ErrorCode::Utf8Error);
    }
    unsafe { CStr::from_ptr(p) }
        .to_str()
        .map_err(|_| ErrorCode::Utf8Error)
}

/// Accept "addr/prefix" OR a plain address (a host route).
fn parse_cidr(s: &str) -> Result<(IpAddr, u8), ErrorCode> {
    let s = s.trim();
    if let Ok(net) = s.parse::<IpNet>() {
        return Ok((net.addr(), net.prefix_len()));
    }
    if let Ok(ip) = s.parse::<IpAddr>() {
        return Ok((ip, IpNet::from(ip).prefix_len()));
    }
    // `ipnet` refuses out-of-range prefixes; report those as such
    match s.split_once('/') {
        Some((addr, plen)) if addr.parse::<IpAddr>().is_ok() && plen.parse::<u8>().is_ok() => {
            Err(ErrorCode::InvalidCidr)
        }
        _ => Err(ErrorCode::ParseError),
    }
}

fn parse_addr(s: &str) -> Result<IpAddr, ErrorCode> {
    s.trim().parse::<IpAddr>().map_err(|_| ErrorCode::ParseError)
}

macro_rules! try_c { ($expr:expr) => { match $expr {
    Ok(v)  => v,
    Err(e) => return record(e),
}}}

// ───────────────────────── lifetime ──────────────────────────────────── //

/// Create a table holding at most `capacity` nodes (0 = default) and store its
/// handle in `*out`.
#[no_mangle]
pub extern "C" fn allowedips_open(capacity: usize, out: *mut HandleId) -> ErrorCode {
    if out.is_null() {
        return record(ErrorCode::InvalidHandle);
    }
    telemetry::init();
    let config = if capacity == 0 {
        Config::default()
    } else {
        Config::with_capacity(capacity)
    };
    let id = handle_registry::register_handle(config);
    unsafe { *out = id };
    record(ErrorCode::Success)
}

#[no_mangle]
pub extern "C" fn allowedips_close(h: HandleId) -> ErrorCode {
    try_c!(handle_registry::unregister_handle(h));
    record(ErrorCode::Success)
}

// ───────────────────────── mutation ──────────────────────────────────── //

#[no_mangle]
pub extern "C" fn allowedips_insert(h: HandleId, peer: PeerId, cidr_utf8: *const c_char) -> ErrorCode {
    let (addr, cidr) = try_c!(cstr(cidr_utf8).and_then(parse_cidr));
    let result = try_c!(handle_registry::with_handle(h, |t| t.insert(peer, addr, cidr)));
    match result {
        Ok(()) => record(ErrorCode::Success),
        Err(e) => record(ErrorCode::from(&e)),
    }
}

/// Remove one prefix, only if `peer` owns it. `NotFound` otherwise.
#[no_mangle]
pub extern "C" fn allowedips_remove(h: HandleId, peer: PeerId, cidr_utf8: *const c_char) -> ErrorCode {
    let (addr, cidr) = try_c!(cstr(cidr_utf8).and_then(parse_cidr));
    let removed = try_c!(handle_registry::with_handle(h, |t| t.remove(peer, addr, cidr)));
    record(if removed { ErrorCode::Success } else { ErrorCode::NotFound })
}

/// Drop every prefix of `peer` and forget the id.
#[no_mangle]
pub extern "C" fn allowedips_remove_by_peer(h: HandleId, peer: PeerId) -> ErrorCode {
    let known = try_c!(handle_registry::with_handle(h, |t| t.remove_peer(peer)));
    record(if known { ErrorCode::Success } else { ErrorCode::NotFound })
}

#[no_mangle]
pub extern "C" fn allowedips_clear(h: HandleId) -> ErrorCode {
    try_c!(handle_registry::with_handle(h, |t| t.clear()));
    record(ErrorCode::Success)
}

// ───────────────────────── lookup ────────────────────────────────────── //

/// Look up a textual address. On a hit the owning peer id goes to `*out_peer`;
/// a miss is `NotFound`.
#[no_mangle]
pub extern "C" fn allowedips_lookup(h: HandleId, addr_utf8: *const c_char, out_peer: *mut PeerId) -> ErrorCode {
    if out_peer.is_null() {
        return record(ErrorCode::InvalidHandle);
    }
    let addr = try_c!(cstr(addr_utf8).and_then(parse_addr));
    let hit = try_c!(handle_registry::with_handle(h, |t| t.table.lookup(addr).map(|p| p.id)));
    match hit {
        Some(id) => {
            unsafe { *out_peer = id };
            record(ErrorCode::Success)
        }
        None => record(ErrorCode::NotFound),
    }
}

/// Look up the destination address of the raw IP packet at `packet[..len]`.
#[no_mangle]
pub extern "C" fn allowedips_lookup_dst(
    h: HandleId,
    packet: *const u8,
    len: usize,
    out_peer: *mut PeerId,
) -> ErrorCode {
    if out_peer.is_null() {
        return record(ErrorCode::InvalidHandle);
    }
    if packet.is_null() {
        return record(ErrorCode::InvalidAddress);
    }
    let bytes = unsafe { std::slice::from_raw_parts(packet, len) };
    if crate::packet::destination(bytes).is_none() {
        return record(ErrorCode::InvalidAddress);
    }
    let hit = try_c!(handle_registry::with_handle(h, |t| t.table.lookup_dst(bytes).map(|p| p.id)));
    match hit {
        Some(id) => {
            unsafe { *out_peer = id };
            record(ErrorCode::Success)
        }
        None => record(ErrorCode::NotFound),
    }
}

// ───────────────────── capacity & maintenance ────────────────────────── //

#[no_mangle]
pub extern "C" fn allowedips_available_capacity(h: HandleId, out: *mut u64) -> ErrorCode {
    if out.is_null() {
        return record(ErrorCode::InvalidHandle);
    }
    let free = try_c!(handle_registry::with_handle(h, |t| {
        t.table.report_capacity_metrics();
        t.table.available_capacity()
    }));
    unsafe { *out = free as u64 };
    record(ErrorCode::Success)
}

/// Run deferred frees now.
#[no_mangle]
pub extern "C" fn allowedips_flush(h: HandleId) -> ErrorCode {
    try_c!(handle_registry::with_handle(h, |t| t.table.flush()));
    record(ErrorCode::Success)
}
