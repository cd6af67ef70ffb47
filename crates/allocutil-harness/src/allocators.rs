//! Allocators the serving binary can host.

use allocutil_core::{Address, ReplayAllocator};

/// The process's own libc `malloc` family.
#[derive(Debug, Default, Clone, Copy)]
pub struct LibcAllocator;

impl ReplayAllocator for LibcAllocator {
    fn allocate(&mut self, size: usize) -> Address {
        // SAFETY: malloc accepts any size, including zero.
        Address::from_raw(unsafe { libc::malloc(size) } as usize)
    }

    fn reallocate(&mut self, old: Address, size: usize) -> Address {
        // SAFETY: `old` is null or was returned by this allocator and not freed.
        Address::from_raw(unsafe { libc::realloc(old.raw() as *mut libc::c_void, size) } as usize)
    }

    fn free(&mut self, address: Address) {
        // SAFETY: `address` is null or was returned by this allocator and not freed.
        unsafe { libc::free(address.raw() as *mut libc::c_void) }
    }
}

/// Bump allocator over one anonymous mapping, with no headers or padding.
///
/// Freeing or shrinking the most recent block gives its tail back; any other
/// free is a no-op. The pool never grows; exhaustion answers null.
#[derive(Debug)]
pub struct PoolAllocator {
    base: *mut u8,
    capacity: usize,
    top: usize,
    /// Offset and length of the most recent block.
    last: Option<(usize, usize)>,
}

impl PoolAllocator {
    /// Map `capacity` bytes of fresh anonymous memory.
    pub fn map(capacity: usize) -> std::io::Result<Self> {
        // SAFETY: a fresh private anonymous mapping; no existing memory is touched.
        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                capacity,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(std::io::Error::last_os_error());
        }
        Ok(Self {
            base: base.cast(),
            capacity,
            top: 0,
            last: None,
        })
    }

    /// Bytes between the pool start and the bump pointer.
    #[cfg(test)]
    fn used(&self) -> usize {
        self.top
    }

    fn offset_of(&self, address: Address) -> Option<usize> {
        let off = address.raw().checked_sub(self.base as usize)?;
        (off < self.capacity).then_some(off)
    }

    fn address_at(&self, offset: usize) -> Address {
        Address::from_raw(self.base as usize + offset)
    }
}

impl ReplayAllocator for PoolAllocator {
    fn allocate(&mut self, size: usize) -> Address {
        let Some(end) = self.top.checked_add(size).filter(|end| *end <= self.capacity) else {
            return Address::NULL;
        };
        let start = self.top;
        self.top = end;
        self.last = Some((start, size));
        self.address_at(start)
    }

    fn reallocate(&mut self, old: Address, size: usize) -> Address {
        if old.is_null() {
            return self.allocate(size);
        }
        if size == 0 {
            self.free(old);
            return Address::NULL;
        }
        let Some(off) = self.offset_of(old) else {
            return Address::NULL;
        };
        if let Some((last_off, _)) = self.last
            && last_off == off
        {
            let Some(end) = off.checked_add(size).filter(|end| *end <= self.capacity) else {
                return Address::NULL;
            };
            self.top = end;
            self.last = Some((off, size));
            return old;
        }
        // Block sizes are not recorded, so copy at most up to the bump pointer.
        let copy = size.min(self.top - off);
        let new = self.allocate(size);
        if !new.is_null() {
            // SAFETY: both ranges lie inside the mapping and do not overlap,
            // since `new` starts at or after the old bump pointer.
            unsafe {
                std::ptr::copy_nonoverlapping(self.base.add(off), new.raw() as *mut u8, copy);
            }
        }
        new
    }

    fn free(&mut self, address: Address) {
        let Some(off) = self.offset_of(address) else {
            return;
        };
        if let Some((last_off, _)) = self.last
            && last_off == off
        {
            self.top = off;
            self.last = None;
        }
    }
}

impl Drop for PoolAllocator {
    fn drop(&mut self) {
        // SAFETY: unmapping exactly the region created in `map`.
        unsafe {
            libc::munmap(self.base.cast(), self.capacity);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_packs_blocks_without_padding() {
        let mut pool = PoolAllocator::map(200).unwrap();
        let a = pool.allocate(100);
        let b = pool.allocate(100);
        assert_eq!(b.raw() - a.raw(), 100);
        assert_eq!(pool.used(), 200);
        assert!(pool.allocate(1).is_null());
    }

    #[test]
    fn freeing_the_last_block_rolls_back() {
        let mut pool = PoolAllocator::map(64).unwrap();
        let a = pool.allocate(16);
        let b = pool.allocate(16);
        pool.free(b);
        assert_eq!(pool.used(), 16);
        // Not the last block any more; nothing changes.
        pool.free(a);
        assert_eq!(pool.used(), 16);
    }

    #[test]
    fn last_block_reallocates_in_place() {
        let mut pool = PoolAllocator::map(64).unwrap();
        let _a = pool.allocate(8);
        let b = pool.allocate(8);
        assert_eq!(pool.reallocate(b, 32), b);
        assert_eq!(pool.used(), 40);
        assert_eq!(pool.reallocate(b, 4), b);
        assert_eq!(pool.used(), 12);
    }

    #[test]
    fn moving_reallocate_copies_contents() {
        let mut pool = PoolAllocator::map(64).unwrap();
        let a = pool.allocate(4);
        // SAFETY: `a` points at 4 writable bytes inside the pool.
        unsafe { std::ptr::copy_nonoverlapping(b"abcd".as_ptr(), a.raw() as *mut u8, 4) };
        let _b = pool.allocate(4);
        let moved = pool.reallocate(a, 8);
        assert_ne!(moved, a);
        // SAFETY: `moved` points at 8 bytes inside the pool.
        let bytes = unsafe { std::slice::from_raw_parts(moved.raw() as *const u8, 4) };
        assert_eq!(bytes, b"abcd");
    }

    #[test]
    fn realloc_to_zero_frees() {
        let mut pool = PoolAllocator::map(32).unwrap();
        let a = pool.allocate(32);
        assert!(pool.reallocate(a, 0).is_null());
        assert_eq!(pool.used(), 0);
    }

    #[test]
    fn libc_allocator_round_trip() {
        let mut alloc = LibcAllocator;
        let a = alloc.allocate(64);
        assert!(!a.is_null());
        let b = alloc.reallocate(a, 4096);
        assert!(!b.is_null());
        alloc.free(b);
    }
}
