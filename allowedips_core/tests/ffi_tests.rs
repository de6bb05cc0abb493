use std::ffi::{CStr, CString};
use std::os::raw::c_char;
use std::sync::atomic::{AtomicU64, Ordering};

use allowedips_core::errors::{allowedips_last_error, allowedips_strerror};
use allowedips_core::public_api::*;
use allowedips_core::telemetry::allowedips_register_stats_callback;
use allowedips_core::ErrorCode;

fn c(s: &str) -> CString {
    CString::new(s).unwrap()
}

fn open(capacity: usize) -> u64 {
    let mut h = 0u64;
    assert_eq!(allowedips_open(capacity, &mut h), ErrorCode::Success);
    assert_ne!(h, 0);
    h
}

fn lookup(h: u64, addr: &str) -> Result<u64, ErrorCode> {
    let mut peer = 0u64;
    match allowedips_lookup(h, c(addr).as_ptr(), &mut peer) {
        ErrorCode::Success => Ok(peer),
        e => Err(e),
    }
}

#[test]
fn insert_lookup_remove_over_c_abi() {
    let h = open(0);
    assert_eq!(allowedips_insert(h, 1, c("10.0.0.0/8").as_ptr()), ErrorCode::Success);
    assert_eq!(allowedips_insert(h, 2, c("10.1.0.0/16").as_ptr()), ErrorCode::Success);
    assert_eq!(allowedips_insert(h, 3, c("10.1.2.3").as_ptr()), ErrorCode::Success);
    assert_eq!(allowedips_insert(h, 2, c("fd00::/8").as_ptr()), ErrorCode::Success);

    assert_eq!(lookup(h, "10.1.2.3"), Ok(3));
    assert_eq!(lookup(h, "10.1.2.4"), Ok(2));
    assert_eq!(lookup(h, "10.9.9.9"), Ok(1));
    assert_eq!(lookup(h, "fd00::1"), Ok(2));
    assert_eq!(lookup(h, "192.168.0.1"), Err(ErrorCode::NotFound));
    assert_eq!(allowedips_last_error(), ErrorCode::NotFound);

    assert_eq!(allowedips_remove(h, 1, c("10.1.0.0/16").as_ptr()), ErrorCode::NotFound);
    assert_eq!(allowedips_remove(h, 3, c("10.1.2.3/32").as_ptr()), ErrorCode::Success);
    assert_eq!(lookup(h, "10.1.2.3"), Ok(2));

    assert_eq!(allowedips_remove_by_peer(h, 2), ErrorCode::Success);
    assert_eq!(allowedips_remove_by_peer(h, 2), ErrorCode::NotFound);
    assert_eq!(lookup(h, "10.1.2.3"), Ok(1));
    assert_eq!(lookup(h, "fd00::1"), Err(ErrorCode::NotFound));

    assert_eq!(allowedips_clear(h), ErrorCode::Success);
    assert_eq!(lookup(h, "10.9.9.9"), Err(ErrorCode::NotFound));
    assert_eq!(allowedips_close(h), ErrorCode::Success);
}

#[test]
fn bad_input_is_reported() {
    let h = open(16);
    assert_eq!(allowedips_insert(h, 1, c("10.0.0.0/33").as_ptr()), ErrorCode::InvalidCidr);
    assert_eq!(allowedips_last_error(), ErrorCode::InvalidCidr);
    assert_eq!(allowedips_insert(h, 1, c("not-an-ip").as_ptr()), ErrorCode::ParseError);
    assert_eq!(allowedips_insert(h, 1, std::ptr::null()), ErrorCode::Utf8Error);
    assert_eq!(lookup(h, "10.0.0.0/8"), Err(ErrorCode::ParseError));

    let mut out = 0u64;
    assert_eq!(
        allowedips_lookup(h, c("10.0.0.1").as_ptr(), std::ptr::null_mut()),
        ErrorCode::InvalidHandle
    );
    assert_eq!(allowedips_lookup(0, c("10.0.0.1").as_ptr(), &mut out), ErrorCode::InvalidHandle);
    assert_eq!(allowedips_open(16, std::ptr::null_mut()), ErrorCode::InvalidHandle);

    assert_eq!(allowedips_close(h), ErrorCode::Success);
    assert_eq!(allowedips_close(h), ErrorCode::InvalidHandle);
    assert_eq!(allowedips_insert(h, 1, c("10.0.0.0/8").as_ptr()), ErrorCode::InvalidHandle);

    let msg = unsafe { CStr::from_ptr(allowedips_strerror(ErrorCode::InvalidCidr)) };
    assert_eq!(msg.to_str().unwrap(), "Invalid CIDR length");
}

#[test]
fn capacity_and_out_of_memory() {
    let h = open(2);
    let mut free = 0u64;
    assert_eq!(allowedips_available_capacity(h, &mut free), ErrorCode::Success);
    assert_eq!(free, 2);

    assert_eq!(allowedips_insert(h, 1, c("10.0.0.0/24").as_ptr()), ErrorCode::Success);
    assert_eq!(allowedips_insert(h, 2, c("10.0.1.0/24").as_ptr()), ErrorCode::OutOfMemory);
    assert_eq!(lookup(h, "10.0.1.1"), Err(ErrorCode::NotFound));

    assert_eq!(allowedips_remove_by_peer(h, 1), ErrorCode::Success);
    for _ in 0..10_000 {
        assert_eq!(allowedips_flush(h), ErrorCode::Success);
        allowedips_available_capacity(h, &mut free);
        if free == 2 {
            break;
        }
        std::thread::yield_now();
    }
    assert_eq!(free, 2);
    assert_eq!(allowedips_close(h), ErrorCode::Success);
}

#[test]
fn packet_destination_lookup() {
    let h = open(0);
    assert_eq!(allowedips_insert(h, 9, c("192.168.0.0/16").as_ptr()), ErrorCode::Success);

    let mut packet = [0u8; 28];
    packet[0] = 0x45;
    packet[16..20].copy_from_slice(&[192, 168, 4, 4]);
    let mut peer = 0u64;
    assert_eq!(
        allowedips_lookup_dst(h, packet.as_ptr(), packet.len(), &mut peer),
        ErrorCode::Success
    );
    assert_eq!(peer, 9);

    packet[16] = 172;
    assert_eq!(
        allowedips_lookup_dst(h, packet.as_ptr(), packet.len(), &mut peer),
        ErrorCode::NotFound
    );
    assert_eq!(
        allowedips_lookup_dst(h, packet.as_ptr(), 12, &mut peer),
        ErrorCode::InvalidAddress
    );
    assert_eq!(allowedips_close(h), ErrorCode::Success);
}

static SEEN_INSERTS: AtomicU64 = AtomicU64::new(0);

unsafe extern "C" fn on_stat(name: *const c_char, value: u64) {
    if CStr::from_ptr(name).to_bytes() == b"allowedips_inserts_total" {
        SEEN_INSERTS.fetch_add(value, Ordering::Relaxed);
    }
}

#[test]
fn stats_callback_sees_inserts() {
    allowedips_register_stats_callback(on_stat);
    let h = open(0);
    let before = SEEN_INSERTS.load(Ordering::Relaxed);
    assert_eq!(allowedips_insert(h, 1, c("10.0.0.0/8").as_ptr()), ErrorCode::Success);
    assert!(SEEN_INSERTS.load(Ordering::Relaxed) > before);
    assert_eq!(allowedips_close(h), ErrorCode::Success);
}
