//! Serving binary: hosts the allocator under test and answers replay
//! requests on the socket descriptor given as its only argument.
//!
//! It asks its parent to trace it and stops itself before touching the
//! allocator, so the tracer sees every heap syscall from the first one.
//! Nothing before that stop may allocate, hence the C `main` and libc
//! environment lookups. Started by hand it will stay stopped.
//!
//! Exit status: 0 after a clean end of stream, 1 on a serving error,
//! 2 on bad usage or configuration, 3 when tracing could not be set up.

#![no_main]
#![allow(unsafe_code)]

use std::ffi::CStr;
use std::os::fd::{FromRawFd, RawFd};
use std::os::unix::net::UnixStream;

use allocutil_core::serve;
use allocutil_harness::allocators::{LibcAllocator, PoolAllocator};
use allocutil_harness::config::AllocatorChoice;
use allocutil_harness::process::stop_for_tracer;
use libc::{c_char, c_int};

const EXIT_SERVE: c_int = 1;
const EXIT_USAGE: c_int = 2;
const EXIT_TRACE: c_int = 3;

/// Environment lookup through libc `getenv`, which does not allocate.
fn env_var(name: &CStr) -> Option<&'static str> {
    // SAFETY: getenv returns null or a pointer into the environment block,
    // which nothing in this process modifies.
    let ptr = unsafe { libc::getenv(name.as_ptr()) };
    if ptr.is_null() {
        return None;
    }
    // SAFETY: non-null getenv results are NUL-terminated and live for the
    // rest of the process.
    unsafe { CStr::from_ptr(ptr) }.to_str().ok()
}

#[unsafe(no_mangle)]
pub extern "C" fn main(argc: c_int, argv: *const *const c_char) -> c_int {
    if argc != 2 {
        eprintln!("usage: runtrace <fd>");
        return EXIT_USAGE;
    }
    // SAFETY: the C runtime passes `argc` valid NUL-terminated strings.
    let arg = unsafe { CStr::from_ptr(*argv.add(1)) };
    let Some(fd) = arg.to_str().ok().and_then(|s| s.parse::<RawFd>().ok()) else {
        eprintln!("usage: runtrace <fd>");
        return EXIT_USAGE;
    };
    let choice = match AllocatorChoice::parse(
        env_var(c"ALLOCUTIL_ALLOCATOR"),
        env_var(c"ALLOCUTIL_POOL_BYTES"),
    ) {
        Ok(choice) => choice,
        Err(err) => {
            eprintln!("runtrace: {err}");
            return EXIT_USAGE;
        }
    };

    if let Err(err) = stop_for_tracer() {
        eprintln!("runtrace: cannot be traced: {err}");
        return EXIT_TRACE;
    }

    // SAFETY: the parent passed us this descriptor and nothing else owns it.
    let mut stream = unsafe { UnixStream::from_raw_fd(fd) };
    let served = match choice {
        AllocatorChoice::Libc => serve(&mut stream, &mut LibcAllocator),
        AllocatorChoice::Pool(bytes) => match PoolAllocator::map(bytes) {
            Ok(mut pool) => serve(&mut stream, &mut pool),
            Err(err) => {
                eprintln!("runtrace: mapping a {bytes}-byte pool: {err}");
                return EXIT_SERVE;
            }
        },
    };
    match served {
        Ok(_) => 0,
        Err(err) => {
            eprintln!("runtrace: {err}");
            EXIT_SERVE
        }
    }
}
