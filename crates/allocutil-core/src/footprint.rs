//! Heap footprint reconstruction from observed memory-growth syscalls.
//!
//! The tracer feeds one record per completed `brk` or `mmap` call. The
//! footprint is the span of the break segment plus every anonymous mapping
//! ever requested:
//!
//! ```text
//! peak_consumed = peak_break - base_break + anonymous_mapping_bytes
//! ```
//!
//! Growth is assumed monotonic. A shrinking `brk` or a `munmap` is not
//! subtracted, so allocators that hand memory back are charged for their
//! high-water mark.

use serde::Serialize;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HeapFootprint {
    /// Break returned by the first `brk(0)` query, if any was seen.
    pub anchored_base: Option<usize>,
    /// Lowest non-zero break ever returned.
    pub lowest_break: Option<usize>,
    /// Highest break ever returned.
    pub peak_break: usize,
    /// Sum of lengths of anonymous mapping requests.
    pub anonymous_mapping_bytes: usize,
    pub brk_calls: u64,
    pub mmap_calls: u64,
}

impl HeapFootprint {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a completed `brk(requested) = returned`.
    pub fn observe_brk(&mut self, requested: usize, returned: usize) {
        self.brk_calls += 1;
        self.peak_break = self.peak_break.max(returned);
        if returned != 0 {
            self.lowest_break = Some(self.lowest_break.map_or(returned, |lo| lo.min(returned)));
        }
        if self.anchored_base.is_none() && requested == 0 && returned != 0 {
            self.anchored_base = Some(returned);
        }
    }

    /// Record a completed `mmap` request of `length` bytes.
    pub fn observe_mmap(&mut self, length: usize, anonymous: bool) {
        self.mmap_calls += 1;
        if anonymous {
            self.anonymous_mapping_bytes = self.anonymous_mapping_bytes.saturating_add(length);
        }
    }

    /// Start of the break segment: the `brk(0)` anchor, else the lowest break.
    #[must_use]
    pub fn base_break(&self) -> Option<usize> {
        self.anchored_base.or(self.lowest_break)
    }

    /// Peak address space consumed, in bytes. Zero means nothing was observed.
    #[must_use]
    pub fn peak_consumed(&self) -> usize {
        let segment = self
            .base_break()
            .map_or(0, |base| self.peak_break.saturating_sub(base));
        segment.saturating_add(self.anonymous_mapping_bytes)
    }
}
