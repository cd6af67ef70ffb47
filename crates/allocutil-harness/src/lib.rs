//! Measurement harness for allocator space utilization.
//!
//! This crate provides:
//! - Evaluator: replays a trace against a serving subprocess while tracing it
//! - Syscall tracer: ptrace-based `brk`/`mmap` footprint measurement
//! - Allocators: the libc and fixed-pool allocators `runtrace` can host
//! - Structured logging: JSONL diagnostics and run-level events
//! - Configuration and report formatting for the `allocutil` CLI

#![deny(unsafe_code)]

#[allow(unsafe_code)]
pub mod allocators;
pub mod config;
pub mod evaluator;
#[allow(unsafe_code)]
pub mod process;
pub mod report;
pub mod structured_log;
pub mod tracer;

pub use config::{AllocatorChoice, EvalConfig, TraceSelection, Verbosity};
pub use evaluator::{EvalError, Evaluation, Evaluator};
pub use tracer::{ExitKind, FootprintTracer, NoopTracer, SyscallTracer, TracedRun, TracerError};
