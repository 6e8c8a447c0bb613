// Machine-independent page table walker and cache. Tables are reached
// through a small pool of virtual scratch windows ("slots"); walking keeps
// one slot pinned per level so sweeping a range costs a cache lookup per
// level change, not per page.

use alloc::collections::VecDeque;
use alloc::vec::Vec;

use super::space::MmSpace;
use super::PhysAddr;

/// Highest table level any backend uses.
pub const PTAB_MAX_LEVEL: usize = 5;

/// Level used for raw physical windows (zeroing, table setup).
pub const PTAB_UNCACHED: u8 = 0;

/// Cache tuning: keep at least MINFREE slots free, trim back to
/// FREETARGET when below.
pub const PTCACHE_MINFREE: usize = 2;
pub const PTCACHE_FREETARGET: usize = 8;

/// Architecture hooks the walker is parameterized over.
pub trait PtabOps {
    /// Number of table levels (leaf tables are level 1).
    fn levels(&self) -> u8;

    /// Index of `vaddr` within the table at `level`.
    fn idx_level(&self, vaddr: usize, level: u8) -> usize;

    fn read_pte(&self, table_virt: usize, idx: usize) -> u64;
    fn write_pte(&self, table_virt: usize, idx: usize, pte: u64);

    /// Extracts the physical frame a PTE points at.
    fn pte_frame(&self, pte: u64) -> PhysAddr;

    /// Points a cache slot's window at `tab` and invalidates the window's
    /// TLB entry.
    fn map_cache_slot(&self, slot: &PtCacheSlot, tab: PhysAddr);

    /// Validates that `leaf_pte` may live under `parent_pte`; panics on a
    /// user PTE below a kernel-only ancestor.
    fn verify(&self, parent_pte: u64, leaf_pte: u64);

    /// Allocates and zeroes a fixed table page for `space`, returning its
    /// physical address.
    fn alloc_table(&self, space: &MmSpace, cache: &mut PtCache, vaddr: usize) -> PhysAddr;

    /// Builds the intermediate PTE installing `tab` under a parent, with
    /// architecture-correct flags for the eventual `leaf_pte`.
    fn table_pte(&self, vaddr: usize, leaf_pte: u64, tab: PhysAddr) -> u64;
}

/// One scratch window of the page table cache.
pub struct PtCacheSlot {
    /// Virtual base of the window.
    pub addr: usize,
    /// Address of the PTE that maps the window.
    pub pte_addr: usize,
    /// Table currently visible through the window.
    pub ptab: PhysAddr,
    pub level: u8,
    pub in_use: bool,
}

/// The page table cache: slots organized into a free list and per-level
/// MRU lists.
pub struct PtCache {
    slots: Vec<PtCacheSlot>,
    /// MRU at the front, eviction candidates from the back.
    lists: [VecDeque<u16>; PTAB_MAX_LEVEL + 1],
    free: Vec<u16>,
}

impl PtCache {
    /// Builds a cache over the given (window, window-PTE) pairs.
    pub fn new(windows: &[(usize, usize)]) -> PtCache {
        let mut slots = Vec::with_capacity(windows.len());
        let mut free = Vec::with_capacity(windows.len());
        for (i, &(addr, pte_addr)) in windows.iter().enumerate() {
            slots.push(PtCacheSlot {
                addr,
                pte_addr,
                ptab: 0,
                level: 0,
                in_use: false,
            });
            free.push(i as u16);
        }
        PtCache {
            slots,
            lists: Default::default(),
            free,
        }
    }

    pub fn slot(&self, idx: u16) -> &PtCacheSlot {
        &self.slots[idx as usize]
    }

    pub fn slot_addr(&self, idx: u16) -> usize {
        self.slots[idx as usize].addr
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    fn setup(&mut self, arch: &dyn PtabOps, idx: u16, ptab: PhysAddr, level: u8) {
        let slot = &mut self.slots[idx as usize];
        slot.ptab = ptab;
        slot.level = level;
        slot.in_use = true;
        arch.map_cache_slot(&self.slots[idx as usize], ptab);
    }

    /// Returns a slot with `ptab` visible: a hit on the level list, a
    /// fresh slot from the free list, or the LRU not-in-use slot of any
    /// level.
    pub fn get(&mut self, arch: &dyn PtabOps, ptab: PhysAddr, level: u8) -> u16 {
        let hit = {
            let slots = &self.slots;
            self.lists[level as usize]
                .iter()
                .position(|&i| slots[i as usize].ptab == ptab)
        };
        if let Some(pos) = hit {
            let idx = self.lists[level as usize].remove(pos).unwrap();
            self.lists[level as usize].push_front(idx);
            self.slots[idx as usize].in_use = true;
            return idx;
        }
        if let Some(idx) = self.free.pop() {
            self.setup(arch, idx, ptab, level);
            self.lists[level as usize].push_front(idx);
            return idx;
        }
        // Evict the least recently used slot that is not pinned
        for lvl in 0..self.lists.len() {
            if let Some(pos) = self.lists[lvl]
                .iter()
                .rposition(|&i| !self.slots[i as usize].in_use)
            {
                let idx = self.lists[lvl].remove(pos).unwrap();
                self.setup(arch, idx, ptab, level);
                self.lists[level as usize].push_front(idx);
                return idx;
            }
        }
        panic!("page table cache exhausted");
    }

    /// Releases a slot back to its level list and trims toward the free
    /// target when the free list runs low.
    pub fn return_slot(&mut self, idx: u16) {
        self.slots[idx as usize].in_use = false;
        if self.free.len() >= PTCACHE_MINFREE {
            return;
        }
        'outer: for lvl in 0..self.lists.len() {
            loop {
                if self.free.len() >= PTCACHE_FREETARGET {
                    break 'outer;
                }
                // Free from the tail: older entries are less likely to be
                // reused
                match self.lists[lvl]
                    .iter()
                    .rposition(|&i| !self.slots[i as usize].in_use)
                {
                    Some(pos) => {
                        let freed = self.lists[lvl].remove(pos).unwrap();
                        self.free.push(freed);
                    }
                    None => break,
                }
            }
        }
    }

    /// Releases a slot straight to the free list.
    pub fn free_to_cache(&mut self, idx: u16) {
        self.slots[idx as usize].in_use = false;
        for list in self.lists.iter_mut() {
            if let Some(pos) = list.iter().position(|&i| i == idx) {
                list.remove(pos);
                break;
            }
        }
        self.free.push(idx);
    }

    /// Returns one slot and fetches another.
    pub fn swap(&mut self, arch: &dyn PtabOps, ptab: PhysAddr, old: u16, level: u8) -> u16 {
        self.return_slot(old);
        self.get(arch, ptab, level)
    }
}

/// Walks to the level-1 table of `vaddr`, creating missing intermediate
/// tables. Returns the slot holding the leaf table.
pub fn walk_and_map(
    space: &MmSpace,
    cache: &mut PtCache,
    arch: &dyn PtabOps,
    as_phys: PhysAddr,
    vaddr: usize,
    leaf_pte: u64,
) -> u16 {
    let mut slot = cache.get(arch, as_phys, arch.levels());
    let mut level = arch.levels();
    while level > 1 {
        let table_virt = cache.slot_addr(slot);
        let idx = arch.idx_level(vaddr, level);
        let pte = arch.read_pte(table_virt, idx);
        let next = if pte != 0 {
            arch.verify(pte, leaf_pte);
            arch.pte_frame(pte)
        } else {
            let tab = arch.alloc_table(space, cache, vaddr);
            let table_virt = cache.slot_addr(slot);
            arch.write_pte(table_virt, idx, arch.table_pte(vaddr, leaf_pte, tab));
            tab
        };
        slot = cache.swap(arch, next, slot, level - 1);
        level -= 1;
    }
    slot
}

/// Walks to the level-1 table of `vaddr`.
///
/// # Panics
/// If any intermediate table is absent; callers only walk mappings that
/// must exist.
pub fn walk(cache: &mut PtCache, arch: &dyn PtabOps, as_phys: PhysAddr, vaddr: usize) -> u16 {
    let mut slot = cache.get(arch, as_phys, arch.levels());
    let mut level = arch.levels();
    while level > 1 {
        let table_virt = cache.slot_addr(slot);
        let idx = arch.idx_level(vaddr, level);
        let pte = arch.read_pte(table_virt, idx);
        if pte == 0 {
            panic!("walk into invalid mapping at {:#x}", vaddr);
        }
        slot = cache.swap(arch, arch.pte_frame(pte), slot, level - 1);
        level -= 1;
    }
    slot
}

#[derive(Default)]
struct IterLevel {
    slot: Option<u16>,
}

/// Range iterator: strides page by page, keeping a cached slot per level
/// so only table-boundary crossings touch the cache.
pub struct PtIter {
    pub addr: usize,
    as_phys: PhysAddr,
    as_slot: Option<u16>,
    levels: [IterLevel; PTAB_MAX_LEVEL + 1],
}

impl PtIter {
    pub fn new(as_phys: PhysAddr, addr: usize) -> PtIter {
        PtIter {
            addr,
            as_phys,
            as_slot: None,
            levels: Default::default(),
        }
    }

    /// Returns the slot for the leaf table covering the current address
    /// and advances by one page. `None` when an intermediate table is
    /// absent (the page cannot be mapped).
    pub fn next(&mut self, cache: &mut PtCache, arch: &dyn PtabOps) -> Option<u16> {
        let top = arch.levels();
        if self.as_slot.is_none() {
            self.as_slot = Some(cache.get(arch, self.as_phys, top));
        }
        let mut parent = self.as_slot.unwrap();
        let mut level = top;
        while level > 1 {
            let li = (level - 1) as usize;
            let cur_idx = arch.idx_level(self.addr, level - 1);
            // Refresh when this level hasn't been cached yet or the walk
            // crossed into a new table (index wrapped to zero)
            if self.levels[li].slot.is_none() || cur_idx == 0 {
                if let Some(old) = self.levels[li].slot.take() {
                    cache.return_slot(old);
                }
                let parent_virt = cache.slot_addr(parent);
                let pte = arch.read_pte(parent_virt, arch.idx_level(self.addr, level));
                if pte == 0 {
                    self.addr += super::PAGE_SIZE;
                    return None;
                }
                self.levels[li].slot = Some(cache.get(arch, arch.pte_frame(pte), level - 1));
            }
            parent = self.levels[li].slot.unwrap();
            level -= 1;
        }
        self.addr += super::PAGE_SIZE;
        Some(parent)
    }

    /// Returns every slot the iterator still pins.
    pub fn end(&mut self, cache: &mut PtCache) {
        for lvl in self.levels.iter_mut() {
            if let Some(slot) = lvl.slot.take() {
                cache.return_slot(slot);
            }
        }
        if let Some(slot) = self.as_slot.take() {
            cache.return_slot(slot);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::PAGE_SIZE;
    use core::cell::{Cell, RefCell};
    use std::collections::HashMap;

    // A 3-level software MMU: 512 entries per table, pte bit 0 = present,
    // frame in bits 12+.
    struct MockArch {
        mem: RefCell<HashMap<u64, [u64; 512]>>,
        windows: RefCell<HashMap<usize, u64>>,
        next_phys: Cell<u64>,
        allocs: Cell<usize>,
    }

    impl MockArch {
        fn new() -> Self {
            Self {
                mem: RefCell::new(HashMap::new()),
                windows: RefCell::new(HashMap::new()),
                next_phys: Cell::new(0x10_0000),
                allocs: Cell::new(0),
            }
        }

        fn new_table(&self) -> u64 {
            let phys = self.next_phys.get();
            self.next_phys.set(phys + PAGE_SIZE as u64);
            self.mem.borrow_mut().insert(phys, [0; 512]);
            phys
        }
    }

    impl PtabOps for MockArch {
        fn levels(&self) -> u8 {
            3
        }
        fn idx_level(&self, vaddr: usize, level: u8) -> usize {
            (vaddr >> (12 + 9 * (level as usize - 1))) & 0x1FF
        }
        fn read_pte(&self, table_virt: usize, idx: usize) -> u64 {
            let phys = *self.windows.borrow().get(&table_virt).unwrap();
            self.mem.borrow().get(&phys).unwrap()[idx]
        }
        fn write_pte(&self, table_virt: usize, idx: usize, pte: u64) {
            let phys = *self.windows.borrow().get(&table_virt).unwrap();
            self.mem.borrow_mut().get_mut(&phys).unwrap()[idx] = pte;
        }
        fn pte_frame(&self, pte: u64) -> u64 {
            pte & !0xFFF
        }
        fn map_cache_slot(&self, slot: &PtCacheSlot, tab: u64) {
            self.windows.borrow_mut().insert(slot.addr, tab);
        }
        fn verify(&self, _parent: u64, _leaf: u64) {}
        fn alloc_table(&self, _space: &MmSpace, _cache: &mut PtCache, _vaddr: usize) -> u64 {
            self.allocs.set(self.allocs.get() + 1);
            self.new_table()
        }
        fn table_pte(&self, _vaddr: usize, _leaf: u64, tab: u64) -> u64 {
            tab | 1
        }
    }

    fn test_cache(n: usize) -> PtCache {
        let windows: Vec<(usize, usize)> = (0..n)
            .map(|i| (0xCAFE_0000 + i * PAGE_SIZE, 0xBEEF_0000 + i * 8))
            .collect();
        PtCache::new(&windows)
    }

    fn dummy_space() -> alloc::sync::Arc<MmSpace> {
        MmSpace::new(0, usize::MAX)
    }

    #[test]
    fn test_cache_hit_reuses_slot() {
        let arch = MockArch::new();
        let mut cache = test_cache(16);
        let tab = arch.new_table();
        let a = cache.get(&arch, tab, 2);
        cache.return_slot(a);
        let b = cache.get(&arch, tab, 2);
        assert_eq!(a, b);
        assert_eq!(cache.slot(b).ptab, tab);
    }

    #[test]
    fn test_cache_eviction_when_full() {
        let arch = MockArch::new();
        let mut cache = test_cache(4);
        let mut slots = Vec::new();
        for _ in 0..4 {
            let tab = arch.new_table();
            slots.push(cache.get(&arch, tab, 1));
        }
        assert_eq!(cache.free_count(), 0);
        // Release one, then a new table must evict it
        cache.return_slot(slots[0]);
        let tab = arch.new_table();
        let s = cache.get(&arch, tab, 1);
        assert_eq!(cache.slot(s).ptab, tab);
    }

    #[test]
    #[should_panic(expected = "cache exhausted")]
    fn test_cache_exhaustion_panics() {
        let arch = MockArch::new();
        let mut cache = test_cache(2);
        // Keep every slot pinned
        for _ in 0..3 {
            let tab = arch.new_table();
            cache.get(&arch, tab, 1);
        }
    }

    #[test]
    fn test_slot_window_tracks_table() {
        // Cache invariant: an in-use slot's window resolves to its table
        let arch = MockArch::new();
        let mut cache = test_cache(8);
        let t1 = arch.new_table();
        let t2 = arch.new_table();
        let s1 = cache.get(&arch, t1, 2);
        let s2 = cache.get(&arch, t2, 1);
        let windows = arch.windows.borrow();
        assert_eq!(windows[&cache.slot_addr(s1)], t1);
        assert_eq!(windows[&cache.slot_addr(s2)], t2);
        assert_eq!(cache.slot(s1).level, 2);
        assert_eq!(cache.slot(s2).level, 1);
    }

    #[test]
    fn test_walk_and_map_builds_tables() {
        let arch = MockArch::new();
        let mut cache = test_cache(16);
        let space = dummy_space();
        let root = arch.new_table();
        let vaddr = 0x4020_3000usize;
        let leaf = 0xABC000u64 | 1;
        let slot = walk_and_map(&space, &mut cache, &arch, root, vaddr, leaf);
        // Two intermediate levels created
        assert_eq!(arch.allocs.get(), 2);
        let tv = cache.slot_addr(slot);
        arch.write_pte(tv, arch.idx_level(vaddr, 1), leaf);
        cache.return_slot(slot);
        // Re-walk without creating anything new
        let slot = walk(&mut cache, &arch, root, vaddr);
        let tv = cache.slot_addr(slot);
        assert_eq!(arch.read_pte(tv, arch.idx_level(vaddr, 1)), leaf);
        cache.return_slot(slot);
        assert_eq!(arch.allocs.get(), 2);
    }

    #[test]
    #[should_panic(expected = "invalid mapping")]
    fn test_walk_absent_panics() {
        let arch = MockArch::new();
        let mut cache = test_cache(16);
        let root = arch.new_table();
        walk(&mut cache, &arch, root, 0x1234_5000);
    }

    #[test]
    fn test_iterator_strides_and_skips_holes() {
        let arch = MockArch::new();
        let mut cache = test_cache(16);
        let space = dummy_space();
        let root = arch.new_table();
        let base = 0x20_0000usize;
        // Map 3 pages, leave the 4th without tables far away
        for i in 0..3 {
            let vaddr = base + i * PAGE_SIZE;
            let slot = walk_and_map(&space, &mut cache, &arch, root, vaddr, 1);
            let tv = cache.slot_addr(slot);
            arch.write_pte(tv, arch.idx_level(vaddr, 1), ((i as u64 + 1) << 12) | 1);
            cache.return_slot(slot);
        }
        let mut iter = PtIter::new(root, base);
        for i in 0..3 {
            let slot = iter.next(&mut cache, &arch).expect("mapped page");
            let tv = cache.slot_addr(slot);
            let pte = arch.read_pte(tv, arch.idx_level(base + i * PAGE_SIZE, 1));
            assert_eq!(pte >> 12, i as u64 + 1);
        }
        iter.end(&mut cache);
        // A hole: iterating an unmapped region yields None per page
        let mut iter = PtIter::new(root, 0x4000_0000);
        assert!(iter.next(&mut cache, &arch).is_none());
        assert_eq!(iter.addr, 0x4000_0000 + PAGE_SIZE);
        iter.end(&mut cache);
    }

    #[test]
    fn test_return_slot_trims_toward_target() {
        let arch = MockArch::new();
        let mut cache = test_cache(12);
        let mut slots = Vec::new();
        for _ in 0..11 {
            let tab = arch.new_table();
            slots.push(cache.get(&arch, tab, 1));
        }
        assert_eq!(cache.free_count(), 1);
        // Release all but one. The first release dips below MINFREE and
        // frees itself; the rest stay parked on the level list.
        let last = slots.pop().unwrap();
        for s in slots {
            cache.return_slot(s);
        }
        assert_eq!(cache.free_count(), 2);
        // Drain the free list, then one more release triggers a batch
        // trim back up to the free target
        cache.get(&arch, arch.new_table(), 1);
        cache.get(&arch, arch.new_table(), 1);
        assert_eq!(cache.free_count(), 0);
        cache.return_slot(last);
        assert_eq!(cache.free_count(), PTCACHE_FREETARGET);
    }
}
