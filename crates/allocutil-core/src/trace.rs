//! In-memory trace model.
//!
//! A [`Trace`] is the instruction stream of one replay: an ordered list of
//! [`TraceOperation`]s plus a dense table of live blocks indexed by block
//! number. Two easily-confused numbers live here:
//! - the *operation index* is the position in the stream;
//! - the *block index* names an allocation across operations. Block index
//!   `-1` is the null block and only appears on frees.

use std::collections::TryReserveError;

use serde::Serialize;

/// Block index that denotes "no block". Freeing it is a no-op.
pub const NULL_BLOCK: i64 = -1;

/// Opaque address token produced by the allocator under test.
///
/// The controlling process never dereferences these; they are only echoed
/// back to the subprocess in later free/realloc requests.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct Address(usize);

impl Address {
    /// The null token.
    pub const NULL: Self = Self(0);

    #[must_use]
    pub const fn from_raw(raw: usize) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn raw(self) -> usize {
        self.0
    }

    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Kind of scripted allocator request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OpKind {
    Allocate,
    Reallocate,
    Free,
}

/// One scripted request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TraceOperation {
    pub kind: OpKind,
    pub block: i64,
    /// Requested byte size; zero for frees.
    pub size: usize,
    /// 1-based line in the source file.
    pub line: usize,
}

impl TraceOperation {
    #[must_use]
    pub const fn allocate(block: i64, size: usize) -> Self {
        Self {
            kind: OpKind::Allocate,
            block,
            size,
            line: 0,
        }
    }

    #[must_use]
    pub const fn reallocate(block: i64, size: usize) -> Self {
        Self {
            kind: OpKind::Reallocate,
            block,
            size,
            line: 0,
        }
    }

    #[must_use]
    pub const fn free(block: i64) -> Self {
        Self {
            kind: OpKind::Free,
            block,
            size: 0,
            line: 0,
        }
    }

    /// Dense table slot for this operation, or `None` for the null block.
    #[must_use]
    pub fn slot(&self) -> Option<usize> {
        usize::try_from(self.block).ok()
    }
}

/// Live state of a single block during a replay.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LiveBlock {
    pub address: Address,
    pub size: usize,
}

/// A parsed replay script.
#[derive(Debug, Clone)]
pub struct Trace {
    /// Name the trace was loaded under (path as given to the loader).
    pub name: String,
    /// Header weight; carried through but not used by the measurement.
    pub weight: i64,
    /// Peak live-byte hint declared in the header.
    pub declared_peak_bytes: usize,
    operations: Vec<TraceOperation>,
    live: Vec<LiveBlock>,
}

impl Trace {
    /// Build a trace from already-validated parts.
    ///
    /// Fails only when the live table for `block_count` blocks cannot be
    /// allocated.
    pub fn new(
        name: impl Into<String>,
        weight: i64,
        block_count: usize,
        declared_peak_bytes: usize,
        operations: Vec<TraceOperation>,
    ) -> Result<Self, TryReserveError> {
        let mut live = Vec::new();
        live.try_reserve_exact(block_count)?;
        live.resize(block_count, LiveBlock::default());
        Ok(Self {
            name: name.into(),
            weight,
            declared_peak_bytes,
            operations,
            live,
        })
    }

    #[must_use]
    pub fn operations(&self) -> &[TraceOperation] {
        &self.operations
    }

    #[must_use]
    pub fn block_count(&self) -> usize {
        self.live.len()
    }

    /// Clear the live tables so the trace can be replayed from scratch.
    pub fn reset(&mut self) {
        self.live.fill(LiveBlock::default());
    }

    #[must_use]
    pub fn live_block(&self, slot: usize) -> Option<LiveBlock> {
        self.live.get(slot).copied()
    }

    pub(crate) fn live_mut(&mut self, slot: usize) -> Option<&mut LiveBlock> {
        self.live.get_mut(slot)
    }
}
