//! Integration test: trace files on disk.
//!
//! Validates that:
//! 1. Every trace shipped in `traces/` loads and its peak hint matches
//!    what an in-memory replay measures.
//! 2. Files are named by their joined path.
//! 3. Malformed files fail with the offending line and character.
//!
//! Run: cargo test -p allocutil-core --test loader_test

use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use allocutil_core::protocol::{
    REQUEST_SIZE, RESPONSE_SIZE, ReplayRequest, ReplayResponse, RequestKind,
};
use allocutil_core::{Address, ReplayAllocator, TraceError, load_trace, replay};

fn traces_dir() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../../traces")
}

fn unique_tmp_dir(prefix: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system time should be after UNIX_EPOCH")
        .as_nanos();
    let dir = std::env::temp_dir().join(format!("{prefix}-{}-{nanos}", std::process::id()));
    std::fs::create_dir_all(&dir).expect("create temp dir");
    dir
}

/// Serves each request synchronously as soon as it is written, so a replay
/// can run without a socket or a second thread.
struct Loopback<A> {
    allocator: A,
    pending: Vec<u8>,
    responses: Vec<u8>,
}

impl<A: ReplayAllocator> Write for Loopback<A> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.pending.extend_from_slice(buf);
        while self.pending.len() >= REQUEST_SIZE {
            let record: [u8; REQUEST_SIZE] = self.pending[..REQUEST_SIZE].try_into().unwrap();
            self.pending.drain(..REQUEST_SIZE);
            let req = ReplayRequest::decode(&record).map_err(io::Error::other)?;
            let address = match req.kind {
                RequestKind::Allocate => self.allocator.allocate(req.new_size),
                RequestKind::Reallocate => self.allocator.reallocate(req.old_address, req.new_size),
                RequestKind::Free => {
                    self.allocator.free(req.old_address);
                    Address::NULL
                }
            };
            self.responses.extend_from_slice(&ReplayResponse { address }.encode());
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<A> Read for Loopback<A> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = buf.len().min(self.responses.len()).min(RESPONSE_SIZE);
        buf[..n].copy_from_slice(&self.responses[..n]);
        self.responses.drain(..n);
        Ok(n)
    }
}

/// Hands out distinct addresses forever.
struct Counter(usize);

impl ReplayAllocator for Counter {
    fn allocate(&mut self, size: usize) -> Address {
        self.0 += size.max(1);
        Address::from_raw(self.0)
    }

    fn reallocate(&mut self, _old: Address, size: usize) -> Address {
        if size == 0 {
            return Address::NULL;
        }
        self.allocate(size)
    }

    fn free(&mut self, _address: Address) {}
}

#[test]
fn shipped_traces_load_and_match_their_hints() {
    let dir = traces_dir();
    let mut seen = 0;
    for entry in std::fs::read_dir(&dir).expect("traces dir") {
        let path = entry.unwrap().path();
        if path.extension().and_then(|e| e.to_str()) != Some("rep") {
            continue;
        }
        let name = path.file_name().unwrap().to_str().unwrap().to_string();
        let mut trace = load_trace(&dir, &name).unwrap_or_else(|e| panic!("{name}: {e}"));
        let mut lo = Loopback {
            allocator: Counter(0x10000),
            pending: Vec::new(),
            responses: Vec::new(),
        };
        let out = replay(&mut trace, &mut lo, |_| {}).unwrap_or_else(|e| panic!("{name}: {e}"));
        assert_eq!(
            out.peak_live_bytes, trace.declared_peak_bytes,
            "{name}: declared peak hint disagrees with replay"
        );
        seen += 1;
    }
    assert!(seen >= 5, "expected the default trace set, found {seen} files");
}

#[test]
fn trace_is_named_by_joined_path() {
    let dir = unique_tmp_dir("allocutil-loader");
    std::fs::write(dir.join("one.rep"), "1\n1\n1\n8\na 0 8\n").unwrap();
    let trace = load_trace(&dir, "one.rep").unwrap();
    assert_eq!(trace.name, dir.join("one.rep").display().to_string());
    assert_eq!(trace.operations().len(), 1);
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn malformed_op_reports_file_and_line() {
    let dir = unique_tmp_dir("allocutil-loader");
    std::fs::write(dir.join("bad.rep"), "1\n1\n2\n8\na 0 8\nq 0\n").unwrap();
    let err = load_trace(&dir, "bad.rep").unwrap_err();
    match &err {
        TraceError::UnknownOp { op, line, file } => {
            assert_eq!(*op, 'q');
            assert_eq!(*line, 6);
            assert!(file.ends_with("bad.rep"));
        }
        other => panic!("expected UnknownOp, got {other:?}"),
    }
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn missing_file_names_the_path() {
    let dir = unique_tmp_dir("allocutil-loader");
    let err = load_trace(&dir, "absent.rep").unwrap_err();
    assert!(matches!(err, TraceError::Open { .. }));
    assert!(err.to_string().contains("absent.rep"));
    let _ = std::fs::remove_dir_all(&dir);
}
