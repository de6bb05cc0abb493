use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use allowedips_core::{AllowedIps, Config};
use rand::Rng;

#[derive(Debug, PartialEq, Eq)]
enum Who {
    Base,
    Churn,
    Left,
    Right,
}

fn readers() -> usize {
    num_cpus::get().clamp(2, 8)
}

/// Readers hammer lookups while one writer rebuilds part of the trie. Every
/// answer has to be one that some point-in-time state of the table could give.
#[test]
fn concurrent_readers_see_consistent_answers() {
    let table = Arc::new(AllowedIps::with_config(Config::default()));
    let base = Arc::new(Who::Base);
    let churn = Arc::new(Who::Churn);
    table.insert_v4(&base, Ipv4Addr::new(10, 0, 0, 0), 8).unwrap();

    let n = readers();
    let barrier = Arc::new(Barrier::new(n + 1));
    let stop = Arc::new(AtomicBool::new(false));
    let lookups = Arc::new(AtomicUsize::new(0));

    let mut handles = vec![];
    for _ in 0..n {
        let table = Arc::clone(&table);
        let barrier = Arc::clone(&barrier);
        let stop = Arc::clone(&stop);
        let lookups = Arc::clone(&lookups);
        handles.push(thread::spawn(move || {
            let mut rng = rand::rng();
            barrier.wait();
            while !stop.load(Ordering::Relaxed) {
                // outside the churned /9: always the base route
                let quiet = Ipv4Addr::new(10, rng.random_range(0..128), rng.random(), rng.random());
                let got = table.lookup_v4(quiet);
                assert_eq!(got.as_deref(), Some(&Who::Base), "{quiet}");

                // inside it: base or churn, never nothing
                let busy = Ipv4Addr::new(10, rng.random_range(128..=255), rng.random(), rng.random());
                let got = table.lookup_v4(busy);
                assert!(
                    matches!(got.as_deref(), Some(Who::Base) | Some(Who::Churn)),
                    "{busy} -> {got:?}"
                );
                lookups.fetch_add(2, Ordering::Relaxed);
            }
        }));
    }

    barrier.wait();
    let mut rng = rand::rng();
    for round in 0..2_000 {
        let mut w = table.writer();
        for _ in 0..rng.random_range(1..16) {
            let addr = Ipv4Addr::new(10, rng.random_range(128..=255), rng.random(), 0);
            w.insert_v4(&churn, addr, rng.random_range(9..=32)).unwrap();
        }
        drop(w);
        if round % 3 == 0 {
            table.flush();
        }
        table.remove_by_peer(&churn);
    }
    stop.store(true, Ordering::Relaxed);
    for h in handles {
        h.join().unwrap();
    }

    assert!(lookups.load(Ordering::Relaxed) > 0);
    assert_eq!(table.len(), 1);
    assert_eq!(table.allowed_ips(&base).len(), 1);

    // every unlinked node is eventually reclaimed
    table.remove_by_peer(&base);
    for _ in 0..10_000 {
        table.flush();
        if table.available_capacity() == table.capacity() {
            break;
        }
        thread::yield_now();
    }
    assert_eq!(table.available_capacity(), table.capacity());
}

/// Moving a prefix between peers swaps its owner in place, so readers never
/// fall through to a shorter route in between.
#[test]
fn ownership_transfer_has_no_gap() {
    let table = Arc::new(AllowedIps::new());
    let base = Arc::new(Who::Base);
    let left = Arc::new(Who::Left);
    let right = Arc::new(Who::Right);
    table.insert_v4(&base, Ipv4Addr::new(10, 0, 0, 0), 8).unwrap();
    table.insert_v4(&left, Ipv4Addr::new(10, 1, 0, 0), 16).unwrap();

    let n = readers();
    let barrier = Arc::new(Barrier::new(n + 1));
    let stop = Arc::new(AtomicBool::new(false));

    let mut handles = vec![];
    for _ in 0..n {
        let table = Arc::clone(&table);
        let barrier = Arc::clone(&barrier);
        let stop = Arc::clone(&stop);
        handles.push(thread::spawn(move || {
            barrier.wait();
            let mut seen = [0usize; 2];
            while !stop.load(Ordering::Relaxed) {
                match table.lookup_v4(Ipv4Addr::new(10, 1, 2, 3)).as_deref() {
                    Some(Who::Left) => seen[0] += 1,
                    Some(Who::Right) => seen[1] += 1,
                    other => panic!("gap during transfer: {other:?}"),
                }
            }
            seen
        }));
    }

    barrier.wait();
    for i in 0..20_000 {
        let to = if i % 2 == 0 { &right } else { &left };
        table.insert_v4(to, Ipv4Addr::new(10, 1, 0, 0), 16).unwrap();
    }
    stop.store(true, Ordering::Relaxed);
    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(table.len(), 2);
    assert_eq!(table.allowed_ips(&left).len(), 1);
    assert!(table.allowed_ips(&right).is_empty());
}

/// Writer threads contend for the lock and read back their own inserts; the end
/// state is exactly what was inserted.
#[test]
fn writers_serialize() {
    let table = Arc::new(AllowedIps::new());
    let threads = readers();
    let barrier = Arc::new(Barrier::new(threads));
    let mut handles = vec![];
    for t in 0..threads {
        let table = Arc::clone(&table);
        let barrier = Arc::clone(&barrier);
        handles.push(thread::spawn(move || {
            let me = Arc::new(t);
            barrier.wait();
            for i in 0..256u32 {
                let addr = Ipv4Addr::from(((t as u32) << 24) | (i << 8));
                table.insert_v4(&me, addr, 24).unwrap();
                assert_eq!(table.lookup_v4(addr).as_deref(), Some(&t));
            }
            assert_eq!(table.allowed_ips(&me).len(), 256);
            me
        }));
    }
    let peers: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert_eq!(table.len(), threads * 256);
    for p in &peers {
        table.remove_by_peer(p);
    }
    assert!(table.is_empty());
}
