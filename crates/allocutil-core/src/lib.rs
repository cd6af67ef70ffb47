//! Core model for measuring allocator space utilization.
//!
//! This crate provides:
//! - Trace model and loader: the scripted allocate/realloc/free stream
//! - Replay protocol: fixed-size wire records, the serving loop and the
//!   live-byte accounting driver
//! - Heap footprint: reduction of observed `brk`/`mmap` calls to a peak
//! - Utilization: the final ratio, or "invalid" when nothing was observed
//!
//! Nothing here touches processes or ptrace; see `allocutil-harness`.

pub mod footprint;
pub mod loader;
pub mod protocol;
pub mod trace;
pub mod utilization;

pub use footprint::HeapFootprint;
pub use loader::{TraceError, load_trace, parse_trace};
pub use protocol::{ProtocolError, ReplayAllocator, ReplayOutcome, ReplayStep, replay, serve};
pub use trace::{Address, NULL_BLOCK, OpKind, Trace, TraceOperation};
pub use utilization::{Utilization, UtilizationSample};
