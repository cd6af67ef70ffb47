//! Integration test: replay protocol over a real socket pair.
//!
//! Validates that:
//! 1. The driver and the serving loop agree on framing end to end.
//! 2. Live-byte accounting handles realloc-to-zero, null frees and
//!    in-place reallocation.
//! 3. Replaying the same trace twice gives the same peak.
//! 4. A null address for a non-zero request fails the replay.
//!
//! Run: cargo test -p allocutil-core --test protocol_test

use std::collections::HashMap;
use std::os::unix::net::UnixStream;
use std::thread;

use allocutil_core::protocol::ProtocolError;
use allocutil_core::{Address, ReplayAllocator, ReplayOutcome, Trace, replay, serve};

/// Bump allocator that never reuses addresses and reallocates in place
/// when shrinking.
#[derive(Default)]
struct BumpAllocator {
    next: usize,
    sizes: HashMap<usize, usize>,
    frees: usize,
    fail_over: Option<usize>,
}

impl BumpAllocator {
    fn bump(&mut self, size: usize) -> Address {
        if self.fail_over.is_some_and(|limit| size > limit) {
            return Address::NULL;
        }
        self.next += size.max(1) + 0x1000;
        self.sizes.insert(self.next, size);
        Address::from_raw(self.next)
    }
}

impl ReplayAllocator for BumpAllocator {
    fn allocate(&mut self, size: usize) -> Address {
        self.bump(size)
    }

    fn reallocate(&mut self, old: Address, size: usize) -> Address {
        if size == 0 {
            self.free(old);
            return Address::NULL;
        }
        match self.sizes.get(&old.raw()).copied() {
            Some(cur) if size <= cur => {
                self.sizes.insert(old.raw(), size);
                old
            }
            _ => {
                self.sizes.remove(&old.raw());
                self.bump(size)
            }
        }
    }

    fn free(&mut self, address: Address) {
        self.frees += 1;
        self.sizes.remove(&address.raw());
    }
}

fn run(trace: &mut Trace, allocator: BumpAllocator) -> (Result<ReplayOutcome, ProtocolError>, BumpAllocator, u64) {
    let (mut ours, mut theirs) = UnixStream::pair().expect("socketpair");
    let server = thread::spawn(move || {
        let mut allocator = allocator;
        let served = serve(&mut theirs, &mut allocator).expect("serve");
        (allocator, served)
    });
    let result = replay(trace, &mut ours, |_| {});
    drop(ours);
    let (allocator, served) = server.join().expect("server thread");
    (result, allocator, served)
}

#[test]
fn two_allocations_then_free() {
    let mut trace: Trace = "1\n2\n3\n200\na 0 100\na 1 100\nf 0\n".parse().unwrap();
    let (result, allocator, served) = run(&mut trace, BumpAllocator::default());
    let out = result.unwrap();
    assert_eq!(out.peak_live_bytes, 200);
    assert_eq!(out.final_live_bytes, 100);
    assert_eq!(served, 3);
    assert_eq!(allocator.frees, 1);
}

#[test]
fn realloc_to_zero_matches_free() {
    let mut with_realloc: Trace = "1\n2\n3\n100\na 0 100\nr 0 0\na 1 50\n".parse().unwrap();
    let mut with_free: Trace = "1\n2\n3\n100\na 0 100\nf 0\na 1 50\n".parse().unwrap();

    let (a, _, _) = run(&mut with_realloc, BumpAllocator::default());
    let (b, _, _) = run(&mut with_free, BumpAllocator::default());
    let (a, b) = (a.unwrap(), b.unwrap());

    assert_eq!(a.peak_live_bytes, 100);
    assert_eq!(a.peak_live_bytes, b.peak_live_bytes);
    assert_eq!(a.final_live_bytes, 50);
    assert_eq!(a.final_live_bytes, b.final_live_bytes);
}

#[test]
fn null_free_costs_nothing_and_is_not_sent() {
    let mut trace: Trace = "1\n1\n2\n10\na 0 10\nf -1\n".parse().unwrap();
    let (result, allocator, served) = run(&mut trace, BumpAllocator::default());
    let out = result.unwrap();
    assert_eq!(out.final_live_bytes, 10);
    assert_eq!(out.peak_live_bytes, 10);
    assert_eq!(out.requests_sent, 1);
    assert_eq!(served, 1);
    assert_eq!(allocator.frees, 0);
}

#[test]
fn shrinking_realloc_uses_the_driver_side_old_size() {
    let mut trace: Trace = "1\n2\n4\n300\na 0 200\na 1 100\nr 0 50\nr 0 400\n"
        .parse()
        .unwrap();
    let mut steps = Vec::new();
    let (mut ours, mut theirs) = UnixStream::pair().unwrap();
    let server = thread::spawn(move || serve(&mut theirs, &mut BumpAllocator::default()));
    let out = replay(&mut trace, &mut ours, |step| steps.push((step.live_bytes, step.address))).unwrap();
    drop(ours);
    server.join().unwrap().unwrap();

    let live: Vec<usize> = steps.iter().map(|(l, _)| *l).collect();
    assert_eq!(live, [200, 300, 150, 500]);
    assert_eq!(out.peak_live_bytes, 500);
    // The shrink happened in place.
    assert_eq!(steps[2].1, steps[0].1);
}

#[test]
fn replaying_twice_gives_the_same_peak() {
    let mut trace: Trace = "1\n3\n6\n96\na 0 32\na 1 64\nf 0\na 2 16\nr 1 80\nf 2\n"
        .parse()
        .unwrap();
    let (first, _, _) = run(&mut trace, BumpAllocator::default());
    let (second, _, _) = run(&mut trace, BumpAllocator::default());
    assert_eq!(first.unwrap(), second.unwrap());
}

#[test]
fn null_for_non_zero_size_is_fatal() {
    let mut trace: Trace = "1\n2\n2\n10\na 0 10\na 1 5000\n".parse().unwrap();
    let allocator = BumpAllocator {
        fail_over: Some(1000),
        ..BumpAllocator::default()
    };
    let (result, _, _) = run(&mut trace, allocator);
    match result {
        Err(ProtocolError::NullAddress { size, op_index, .. }) => {
            assert_eq!(size, 5000);
            assert_eq!(op_index, 1);
        }
        other => panic!("expected NullAddress, got {other:?}"),
    }
}

#[test]
fn server_going_away_is_an_unexpected_eof() {
    let mut trace: Trace = "1\n1\n1\n10\na 0 10\n".parse().unwrap();
    let (mut ours, theirs) = UnixStream::pair().unwrap();
    drop(theirs);
    let err = replay(&mut trace, &mut ours, |_| {}).unwrap_err();
    // Depending on timing the write may fail first.
    assert!(matches!(
        err,
        ProtocolError::UnexpectedEof { op_index: 0 } | ProtocolError::Io(_)
    ));
}
