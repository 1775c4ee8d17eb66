//! Cursor allocator for the guest mmap region.
//!
//! Allocation is a page-rounded bump of `mmap_address`; pages come into
//! existence lazily on first fault. A small cache remembers recently
//! unmapped spans and reuses them for later allocations of equal or
//! smaller size.

use crate::arch::{page_round_up, Address};

const MMAP_CACHE_ENTRIES: usize = 8;

#[derive(Debug, Default, Clone)]
pub struct MmapCache {
    spans: Vec<(Address, Address)>,
}

impl MmapCache {
    /// Take a cached span able to hold `size` bytes. Prefers the
    /// smallest span that fits.
    fn take(&mut self, size: Address) -> Option<Address> {
        let mut best: Option<usize> = None;
        for (i, &(_, len)) in self.spans.iter().enumerate() {
            if len >= size && best.map_or(true, |b| len < self.spans[b].1) {
                best = Some(i);
            }
        }
        let i = best?;
        let (addr, len) = self.spans.remove(i);
        if len > size {
            self.spans.push((addr + size, len - size));
        }
        Some(addr)
    }

    fn insert(&mut self, addr: Address, size: Address) {
        if self.spans.len() == MMAP_CACHE_ENTRIES {
            self.spans.remove(0);
        }
        self.spans.push((addr, size));
    }

    pub fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }

    fn remove_at_or_above(&mut self, addr: Address) {
        self.spans.retain(|&(a, _)| a < addr);
    }
}

#[derive(Debug, Clone)]
pub struct MmapAllocator {
    base: Address,
    cursor: Address,
    cache: MmapCache,
}

impl MmapAllocator {
    pub fn new(base: Address) -> MmapAllocator {
        MmapAllocator {
            base,
            cursor: base,
            cache: MmapCache::default(),
        }
    }

    pub fn base(&self) -> Address {
        self.base
    }

    pub fn cursor(&self) -> Address {
        self.cursor
    }

    /// Reserve `bytes` of mmap space and return its base address.
    pub fn allocate(&mut self, bytes: Address) -> Address {
        let size = page_round_up(bytes);
        if size == 0 {
            return self.cursor;
        }
        if let Some(addr) = self.cache.take(size) {
            log::trace!("mmap reuse {:#x} size {:#x}", addr, size);
            return addr;
        }
        let addr = self.cursor;
        self.cursor += size;
        log::trace!("mmap allocate {:#x} size {:#x}", addr, size);
        addr
    }

    /// Shrink the most recent allocation in place. Returns true and
    /// rewinds the cursor when `[addr, addr + size)` ends exactly at
    /// the cursor and the new size is smaller; otherwise a no-op.
    pub fn relax(&mut self, addr: Address, size: Address, new_size: Address) -> bool {
        let size = page_round_up(size);
        let new_size = page_round_up(new_size);
        if addr + size == self.cursor && new_size < size {
            self.cursor = addr + new_size;
            true
        } else {
            false
        }
    }

    /// Release `[addr, addr + size)`. Spans that abut the cursor rewind
    /// it; interior spans go to the reuse cache.
    pub fn unmap(&mut self, addr: Address, size: Address) {
        let size = page_round_up(size);
        if size == 0 || addr < self.base {
            return;
        }
        if addr + size == self.cursor {
            self.cursor = addr;
            // spans cached above the cursor would be handed out twice
            self.cache.remove_at_or_above(self.cursor);
        } else if addr + size <= self.cursor {
            self.cache.insert(addr, size);
        }
    }

    pub fn cache_is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::PAGE_SIZE;

    const BASE: Address = 0x1000_0000;
    const PAGE: Address = PAGE_SIZE as Address;

    #[test]
    fn allocate_bumps_the_cursor() {
        let mut mm = MmapAllocator::new(BASE);
        let a = mm.allocate(100);
        let b = mm.allocate(PAGE + 1);
        assert_eq!(a, BASE);
        assert_eq!(b, BASE + PAGE);
        assert_eq!(mm.cursor(), BASE + 3 * PAGE);
    }

    #[test]
    fn unmap_at_cursor_rewinds() {
        let mut mm = MmapAllocator::new(BASE);
        let a = mm.allocate(2 * PAGE);
        mm.unmap(a, 2 * PAGE);
        assert_eq!(mm.cursor(), BASE);
        assert!(mm.cache_is_empty());
        let b = mm.allocate(2 * PAGE);
        assert_eq!(a, b);
    }

    #[test]
    fn interior_unmap_feeds_the_cache() {
        let mut mm = MmapAllocator::new(BASE);
        let a = mm.allocate(PAGE);
        let _b = mm.allocate(PAGE);
        mm.unmap(a, PAGE);
        assert!(!mm.cache_is_empty());
        let c = mm.allocate(PAGE);
        assert_eq!(c, a);
    }

    #[test]
    fn relax_shrinks_the_top_allocation() {
        let mut mm = MmapAllocator::new(BASE);
        let a = mm.allocate(2 * PAGE);
        assert!(mm.relax(a, 2 * PAGE, PAGE));
        assert_eq!(mm.cursor(), a + PAGE);
        let b = mm.allocate(PAGE);
        assert_eq!(b, a + PAGE);
    }

    #[test]
    fn relax_rejects_interior_spans() {
        let mut mm = MmapAllocator::new(BASE);
        let a = mm.allocate(PAGE);
        let _b = mm.allocate(PAGE);
        assert!(!mm.relax(a, PAGE, 0));
    }
}
