// Kernel virtual memory. Arenas carve the kernel's virtual ranges into
// regions tracked by a per-arena slot array (header at a region's first
// page, footer magic at its last), with five size-class buckets and a
// single-page free list for the hot path.

use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

use super::space::{kernel_object, kernel_space};
use super::{mul, page_align_down, PhysAddr, PAGE_SHIFT, PAGE_SIZE};
use crate::klib::panic::oom;

const KV_MAX_FREELIST: usize = 12;
const KV_REFILL_VAL: usize = 8;
const KV_REFILL_MIN: usize = 4;
const KV_NUM_BUCKETS: usize = 5;
const KV_FOOTER_MAGIC: usize = 0xDEAD_BEEF;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct KvFlags: u32 {
        /// Bind backing pages immediately instead of on first touch.
        const NO_DEMAND = 1 << 0;
    }
}

/// Size classes: 1-4, 5-8, 9-16, 17-32, 33+ pages.
fn bucket_for(num_pages: usize) -> usize {
    debug_assert!(num_pages > 0);
    match num_pages {
        1..=4 => 0,
        5..=8 => 1,
        9..=16 => 2,
        17..=32 => 3,
        _ => 4,
    }
}

/// One slot of the arena's bookkeeping strip. The header fields describe
/// a region starting at this page; the footer fields, when the magic is
/// set, describe a region ending at this page. Footers are only written
/// for regions longer than one page.
#[derive(Clone)]
struct RegionSlot {
    vaddr: usize,
    num_pages: usize,
    is_free: bool,
    on_free_list: bool,
    footer_magic: usize,
    footer_pages: usize,
}

struct ArenaState {
    start: usize,
    slots: Vec<RegionSlot>,
    buckets: [Vec<u32>; KV_NUM_BUCKETS],
    free_list: Vec<u32>,
    num_free_pages: usize,
}

impl ArenaState {
    fn slot_idx(&self, addr: usize) -> usize {
        (addr - self.start) >> PAGE_SHIFT
    }

    fn set_footer(&mut self, idx: u32, num_pages: usize) {
        let f = idx as usize + num_pages - 1;
        self.slots[f].footer_magic = KV_FOOTER_MAGIC;
        self.slots[f].footer_pages = num_pages;
    }

    fn remove_from_bucket(&mut self, idx: u32) {
        let b = bucket_for(self.slots[idx as usize].num_pages);
        let pos = self.buckets[b]
            .iter()
            .position(|&i| i == idx)
            .expect("region not in its bucket");
        self.buckets[b].swap_remove(pos);
    }

    /// Marks `idx` allocated at `num_pages`, splitting off the tail into
    /// its bucket. Caller has already removed `idx` from its bucket.
    fn split_off(&mut self, idx: u32, num_pages: usize) {
        let total = self.slots[idx as usize].num_pages;
        let vaddr = self.slots[idx as usize].vaddr;
        self.slots[idx as usize].is_free = false;
        if total == num_pages {
            return;
        }
        self.slots[idx as usize].num_pages = num_pages;
        if num_pages > 1 {
            self.set_footer(idx, num_pages);
        }
        let tail = idx as usize + num_pages;
        let tail_sz = total - num_pages;
        self.slots[tail].vaddr = vaddr + num_pages * PAGE_SIZE;
        self.slots[tail].num_pages = tail_sz;
        self.slots[tail].is_free = true;
        self.slots[tail].on_free_list = false;
        if tail_sz > 1 {
            self.set_footer(tail as u32, tail_sz);
        }
        self.buckets[bucket_for(tail_sz)].push(tail as u32);
    }

    /// Bucket search always scans upward so large requests never chew
    /// through the small classes.
    fn alloc_in_arena(&mut self, num_pages: usize) -> Option<usize> {
        let mut b = bucket_for(num_pages);
        loop {
            let found = self.buckets[b]
                .iter()
                .position(|&i| self.slots[i as usize].num_pages >= num_pages);
            if let Some(pos) = found {
                let idx = self.buckets[b].swap_remove(pos);
                let vaddr = self.slots[idx as usize].vaddr;
                self.split_off(idx, num_pages);
                self.num_free_pages -= num_pages;
                return Some(vaddr);
            }
            if b == KV_NUM_BUCKETS - 1 {
                return None;
            }
            b += 1;
        }
    }

    /// Coalesces `idx` with free neighbors. The left probe trusts the
    /// preceding footer only after validating it describes a real free
    /// region ending exactly at our base.
    fn join(&mut self, mut idx: u32) -> u32 {
        if idx > 0 && self.slots[idx as usize - 1].footer_magic == KV_FOOTER_MAGIC {
            let lp = self.slots[idx as usize - 1].footer_pages;
            if lp >= 1 && lp <= idx as usize {
                let lidx = idx - lp as u32;
                let left = &self.slots[lidx as usize];
                if left.is_free
                    && !left.on_free_list
                    && left.num_pages == lp
                    && left.vaddr + lp * PAGE_SIZE == self.slots[idx as usize].vaddr
                {
                    self.remove_from_bucket(lidx);
                    let absorbed = self.slots[idx as usize].num_pages;
                    self.slots[lidx as usize].num_pages += absorbed;
                    let sz = self.slots[lidx as usize].num_pages;
                    self.set_footer(lidx, sz);
                    idx = lidx;
                }
            }
        }
        let right = idx as usize + self.slots[idx as usize].num_pages;
        if right < self.slots.len() {
            let r = &self.slots[right];
            if r.is_free
                && !r.on_free_list
                && r.num_pages > 0
                && r.vaddr
                    == self.slots[idx as usize].vaddr
                        + self.slots[idx as usize].num_pages * PAGE_SIZE
            {
                self.remove_from_bucket(right as u32);
                let absorbed = self.slots[right].num_pages;
                self.slots[idx as usize].num_pages += absorbed;
                let sz = self.slots[idx as usize].num_pages;
                self.set_footer(idx, sz);
            }
        }
        idx
    }

    /// Single-page fast path. Refills from the buckets when the list runs
    /// low; this is the only caller of the arena allocator from a free
    /// path, and it goes through the internal helper so it cannot
    /// re-enter the public interface.
    fn alloc_free_list(&mut self) -> Option<usize> {
        let got = self.free_list.pop().map(|idx| {
            self.slots[idx as usize].is_free = false;
            self.slots[idx as usize].on_free_list = false;
            self.num_free_pages -= 1;
            self.slots[idx as usize].vaddr
        });
        if self.free_list.len() <= KV_REFILL_MIN {
            while self.free_list.len() < KV_REFILL_VAL {
                match self.alloc_in_arena(1) {
                    Some(vaddr) => {
                        let idx = self.slot_idx(vaddr) as u32;
                        self.slots[idx as usize].is_free = true;
                        self.slots[idx as usize].on_free_list = true;
                        self.free_list.push(idx);
                        // The page is still allocatable, just parked
                        self.num_free_pages += 1;
                    }
                    None => break, // OOM is not fatal here
                }
            }
        }
        got
    }

    fn free_to_list(&mut self, idx: u32) {
        self.slots[idx as usize].is_free = true;
        self.slots[idx as usize].on_free_list = true;
        self.free_list.push(idx);
    }
}

/// A kernel virtual arena. The boot arena covers the bootloader pool and
/// is pre-mapped; the main arena covers the kernel allocation range and
/// demand-pages through the kernel object.
pub struct KvArena {
    needs_map: bool,
    start: usize,
    end: usize,
    num_pages: usize,
    state: Mutex<ArenaState>,
}

impl KvArena {
    pub fn new(start: usize, end: usize, needs_map: bool) -> KvArena {
        let num_pages = (end - start) >> PAGE_SHIFT;
        assert!(num_pages > 0);
        let mut slots = Vec::with_capacity(num_pages);
        for i in 0..num_pages {
            slots.push(RegionSlot {
                vaddr: start + i * PAGE_SIZE,
                num_pages: 0,
                is_free: false,
                on_free_list: false,
                footer_magic: 0,
                footer_pages: 0,
            });
        }
        let mut state = ArenaState {
            start,
            slots,
            buckets: Default::default(),
            free_list: Vec::new(),
            num_free_pages: num_pages,
        };
        state.slots[0].num_pages = num_pages;
        state.slots[0].is_free = true;
        if num_pages > 1 {
            state.set_footer(0, num_pages);
        }
        state.buckets[bucket_for(num_pages)].push(0);
        KvArena {
            needs_map,
            start,
            end,
            num_pages,
            state: Mutex::new(state),
        }
    }

    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.start && addr < self.end
    }

    pub fn needs_map(&self) -> bool {
        self.needs_map
    }

    pub fn num_pages(&self) -> usize {
        self.num_pages
    }

    pub fn num_free_pages(&self) -> usize {
        self.state.lock().num_free_pages
    }

    /// Bucket occupancy, order independent: (count, pages) per class.
    pub fn bucket_shape(&self) -> [(usize, usize); KV_NUM_BUCKETS] {
        let state = self.state.lock();
        let mut shape = [(0, 0); KV_NUM_BUCKETS];
        for (b, bucket) in state.buckets.iter().enumerate() {
            shape[b].0 = bucket.len();
            shape[b].1 = bucket
                .iter()
                .map(|&i| state.slots[i as usize].num_pages)
                .sum();
        }
        shape
    }

    fn alloc(&self, num_pages: usize) -> Option<usize> {
        let mut state = self.state.lock();
        if state.num_free_pages < num_pages {
            return None;
        }
        if num_pages == 1 {
            if let Some(p) = state.alloc_free_list() {
                return Some(p);
            }
        }
        state.alloc_in_arena(num_pages)
    }

    /// Frees the region based at `addr`, returning its page count.
    fn free(&self, addr: usize) -> usize {
        let mut state = self.state.lock();
        let idx = state.slot_idx(addr) as u32;
        assert!(
            state.slots[idx as usize].num_pages > 0,
            "free of non-region address {:#x}",
            addr
        );
        assert!(
            !state.slots[idx as usize].is_free,
            "double free of kv region {:#x}",
            addr
        );
        let num = state.slots[idx as usize].num_pages;
        state.num_free_pages += num;
        if num == 1 && state.free_list.len() <= KV_MAX_FREELIST {
            state.free_to_list(idx);
        } else {
            state.slots[idx as usize].is_free = true;
            let joined = state.join(idx);
            let sz = state.slots[joined as usize].num_pages;
            state.buckets[bucket_for(sz)].push(joined);
        }
        num
    }
}

static ARENAS: Mutex<Vec<Arc<KvArena>>> = Mutex::new(Vec::new());

/// Registers an arena; newest arenas are preferred.
pub fn add_arena(arena: Arc<KvArena>) {
    ARENAS.lock().insert(0, arena);
}

fn arena_for(addr: usize) -> Arc<KvArena> {
    let arenas = ARENAS.lock();
    arenas
        .iter()
        .find(|a| a.contains(addr))
        .expect("address outside every kv arena")
        .clone()
}

/// Binds backing to every page of a fresh NO_DEMAND region: allocate,
/// fix, enter into the kernel object, map, and run the backend page-in.
fn get_memory(virt: usize, num_pages: usize) {
    let space = kernel_space();
    let kobj = kernel_object();
    let sys = super::page::page_sys();
    let offset = virt - space.start;
    for i in 0..num_pages {
        let page = match sys.alloc_page() {
            Some(p) => p,
            None => oom(),
        };
        sys.fix_page(&page);
        sys.add_page(&kobj, offset + i * PAGE_SIZE, &page);
        mul::map_page(
            space,
            virt + i * PAGE_SIZE,
            &page,
            mul::MulPerm::KE | mul::MulPerm::RW | mul::MulPerm::R,
        );
        kobj.page_in(offset + i * PAGE_SIZE, &page);
    }
}

/// Releases the backing of a mapped region and unmaps it.
fn free_memory(virt: usize, num_pages: usize) {
    let space = kernel_space();
    let kobj = kernel_object();
    let sys = super::page::page_sys();
    let mut offset = virt - space.start;
    for _ in 0..num_pages {
        if let Some(page) = sys.lookup_page(&kobj, offset) {
            sys.unfix_page(&page);
            sys.remove_page(&page);
            sys.free_page(&page);
        }
        offset += PAGE_SIZE;
    }
    mul::unmap_range(space, virt, num_pages);
}

/// Allocates a virtual region of `num_pages`. Demand-paged by default;
/// `NO_DEMAND` binds backing immediately (and is the only mode the
/// pre-mapped boot arena can serve).
pub fn alloc_kv_region(num_pages: usize, flags: KvFlags) -> Option<usize> {
    let arenas: Vec<Arc<KvArena>> = ARENAS.lock().clone();
    for arena in arenas {
        if !flags.contains(KvFlags::NO_DEMAND) && !arena.needs_map {
            continue;
        }
        if let Some(p) = arena.alloc(num_pages) {
            if flags.contains(KvFlags::NO_DEMAND) && arena.needs_map {
                get_memory(p, num_pages);
            }
            return Some(p);
        }
    }
    None
}

/// Frees a region returned by `alloc_kv_region`.
pub fn free_kv_region(addr: usize) {
    let arena = arena_for(addr);
    let num = arena.free(addr);
    if arena.needs_map {
        free_memory(addr, num);
    }
}

pub fn alloc_kv_page() -> Option<usize> {
    alloc_kv_region(1, KvFlags::NO_DEMAND)
}

pub fn free_kv_page(addr: usize) {
    free_kv_region(addr)
}

/// Maps `num_pages` of MMIO/firmware memory at `phys` into kernel space
/// with the given permissions. The returned pointer carries the intra-page
/// offset of `phys`.
pub fn alloc_kv_mmio(phys: PhysAddr, num_pages: usize, perm: mul::MulPerm) -> usize {
    let virt = match alloc_kv_region(num_pages, KvFlags::empty()) {
        Some(v) => v,
        None => oom(),
    };
    let space = kernel_space();
    let kobj = kernel_object();
    let sys = super::page::page_sys();
    let offset = virt - space.start;
    let base_pfn = phys >> PAGE_SHIFT;
    for i in 0..num_pages {
        let page = sys.find_page_pfn(base_pfn + i as u64);
        sys.add_page(&kobj, offset + i * PAGE_SIZE, &page);
        mul::map_page(space, virt + i * PAGE_SIZE, &page, perm);
    }
    virt + (phys as usize & (PAGE_SIZE - 1))
}

pub fn free_kv_mmio(virt: usize) {
    free_kv_region(page_align_down(virt));
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: usize = 0x4000_0000;

    fn arena(pages: usize) -> KvArena {
        KvArena::new(BASE, BASE + pages * PAGE_SIZE, false)
    }

    #[test]
    fn test_alloc_free_restores_shape() {
        let a = arena(256);
        let shape = a.bucket_shape();
        let free = a.num_free_pages();
        let p = a.alloc(8).unwrap();
        assert_eq!(a.num_free_pages(), free - 8);
        a.free(p);
        assert_eq!(a.num_free_pages(), free);
        assert_eq!(a.bucket_shape(), shape);
    }

    #[test]
    fn test_split_puts_tail_in_right_bucket() {
        let a = arena(64);
        let p = a.alloc(3).unwrap();
        assert_eq!(p, BASE);
        // Tail of 61 pages lands in the 33+ class
        let shape = a.bucket_shape();
        assert_eq!(shape[4], (1, 61));
        let q = a.alloc(61).unwrap();
        assert_eq!(q, BASE + 3 * PAGE_SIZE);
        assert_eq!(a.num_free_pages(), 0);
        a.free(p);
        a.free(q);
        assert_eq!(a.num_free_pages(), 64);
    }

    #[test]
    fn test_coalesce_left_and_right() {
        let a = arena(96);
        let p1 = a.alloc(8).unwrap();
        let p2 = a.alloc(8).unwrap();
        let p3 = a.alloc(8).unwrap();
        assert_eq!(p2, p1 + 8 * PAGE_SIZE);
        assert_eq!(p3, p2 + 8 * PAGE_SIZE);
        // Free the outer two, then the middle: everything must merge back
        a.free(p1);
        a.free(p3);
        a.free(p2);
        // One region again: a full-size allocation succeeds
        let all = a.alloc(96).unwrap();
        assert_eq!(all, BASE);
    }

    #[test]
    fn test_bucket_search_scans_upward() {
        let a = arena(256);
        // Fragment: carve a large free region behind an allocation
        let p = a.alloc(2).unwrap();
        // A request bigger than any 1-4 class region comes from the big
        // region, not the small classes
        let q = a.alloc(40).unwrap();
        assert_eq!(q, p + 2 * PAGE_SIZE);
        a.free(q);
        a.free(p);
    }

    #[test]
    fn test_single_page_free_list() {
        let a = arena(128);
        // First single-page alloc triggers a refill of the free list
        let p = a.alloc(1).unwrap();
        {
            let state = a.state.lock();
            assert_eq!(state.free_list.len(), KV_REFILL_VAL);
        }
        // A free of a single page parks it on the list
        a.free(p);
        {
            let state = a.state.lock();
            assert_eq!(state.free_list.len(), KV_REFILL_VAL + 1);
            assert!(state.slots[state.slot_idx(p)].on_free_list);
        }
        // And the next alloc hands it straight back
        let q = a.alloc(1).unwrap();
        assert_eq!(q, p);
        a.free(q);
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn test_double_free_panics() {
        let a = arena(64);
        let p = a.alloc(4).unwrap();
        a.free(p);
        a.free(p);
    }

    #[test]
    fn test_exhaustion_returns_none() {
        let a = arena(16);
        assert!(a.alloc(32).is_none());
        let p = a.alloc(16).unwrap();
        assert!(a.alloc(1).is_none());
        a.free(p);
    }

    #[test]
    fn test_no_demand_binds_and_free_releases() {
        // Global flow: kernel space + object + a demand arena over the
        // kernel range, with the mock MUL recording mappings.
        crate::mm::page::testing::init_test_global();
        let kstart = crate::mm::KERNEL_ADDR_START;
        let obj = crate::mm::object::MemObject::create(
            0x1000,
            crate::mm::object::MemBackend::Kernel,
            mul::MulPerm::R | mul::MulPerm::RW | mul::MulPerm::KE,
        );
        crate::mm::space::create_kernel_space(obj, kstart, kstart + 0x1000 * PAGE_SIZE);
        add_arena(Arc::new(KvArena::new(
            kstart,
            kstart + 0x1000 * PAGE_SIZE,
            true,
        )));
        let space = kernel_space();
        let maps_before = space.stats.num_maps.load(core::sync::atomic::Ordering::Relaxed);
        let kobj = kernel_object();
        let resident_before = kobj.resident();
        let v = alloc_kv_region(8, KvFlags::NO_DEMAND).unwrap();
        assert_eq!(kobj.resident(), resident_before + 8);
        assert_eq!(
            space.stats.num_maps.load(core::sync::atomic::Ordering::Relaxed),
            maps_before + 8
        );
        // Every bound page is fixed
        let page = crate::mm::page::page_sys()
            .lookup_page(&kobj, v - space.start)
            .unwrap();
        assert!(page.flags().contains(crate::mm::page::PageFlags::FIXED));
        free_kv_region(v);
        assert_eq!(kobj.resident(), resident_before);
        assert_eq!(
            space.stats.num_maps.load(core::sync::atomic::Ordering::Relaxed),
            maps_before
        );
    }
}
