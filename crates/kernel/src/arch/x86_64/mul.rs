// x86_64 MMU backend: 4-level page tables, PAT-aware PTE encoding, the
// page table cache windows, and early-boot mapping over the bootloader's
// tables.
//
// Early boot assumes the bootloader left low physical memory identity
// mapped, so table frames can be dereferenced directly until `init` cuts
// over to the cache windows.

use alloc::sync::Arc;
use spin::Once;

use super::cpu::{self, CpuFeatures};
use crate::mm::mul::{MulAttr, MulBackend, MulPerm};
use crate::mm::page::{self, Page, PageFlags};
use crate::mm::ptab::{self, PtCache, PtCacheSlot, PtabOps, PTAB_UNCACHED};
use crate::mm::space::{kernel_space, kernel_space_opt, MmSpace};
use crate::mm::{PhysAddr, KERNEL_BASE, PAGE_SHIFT, PAGE_SIZE};

// PTE bits
const PF_P: u64 = 1 << 0;
const PF_RW: u64 = 1 << 1;
const PF_US: u64 = 1 << 2;
const PF_WT: u64 = 1 << 3;
const PF_CD: u64 = 1 << 4;
const PF_A: u64 = 1 << 5;
const PF_D: u64 = 1 << 6;
const PF_WC: u64 = 1 << 7;
const PF_G: u64 = 1 << 8;
/// Software bit: the mapping is fixed.
const PF_F: u64 = 1 << 10;
const PF_NX: u64 = 1 << 63;

const PT_FRAME: u64 = 0x7FFF_FFFF_FFFF_F000;

// PAT MSR assignment: PAT4 becomes write combining.
const PAT_MSR: u32 = 0x277;
const PAT_UC: u64 = 0;
const PAT_WC: u64 = 1;
const PAT_WT: u64 = 4;
const PAT_WB: u64 = 6;
const PAT_UC_MINUS: u64 = 7;

const NUM_LEVELS: u8 = 4;

/// Shift per table level; level 1 is the leaf.
const IDX_SHIFT: [u32; 6] = [0, 12, 21, 30, 39, 48];
const IDX_MASK: usize = 0x1FF;

// Page table cache layout: windows at a fixed 2M-aligned base, all
// covered by one leaf table mapped at TABLE_BASE so their PTEs can be
// rewritten directly.
const PTCACHE_BASE: usize = 0xFFFF_FFFF_0020_0000;
const PTCACHE_TABLE_BASE: usize = 0xFFFF_FFFF_0000_1000;
const MAX_PTCACHE: usize = 85;

#[inline]
fn decanonical(addr: usize) -> usize {
    addr & 0x0000_FFFF_FFFF_FFFF
}

#[inline]
fn make_canonical(addr: usize) -> usize {
    if addr & (1 << 47) != 0 {
        addr | 0xFFFF_0000_0000_0000
    } else {
        addr
    }
}

#[inline]
fn is_kernel(addr: usize) -> bool {
    addr >= KERNEL_BASE
}

pub struct X64Mul {
    features: Once<CpuFeatures>,
}

pub static X64_MUL: X64Mul = X64Mul {
    features: Once::new(),
};

impl X64Mul {
    fn feats(&self) -> CpuFeatures {
        *self.features.call_once(cpu::features)
    }

    /// Translates MUL permissions into PTE flags.
    fn prot_flags(&self, perm: MulPerm) -> u64 {
        let feats = self.feats();
        let mut flags = PF_P | PF_US;
        if feats.contains(CpuFeatures::NX) {
            flags |= PF_NX;
        }
        if perm.contains(MulPerm::RW) {
            flags |= PF_RW;
        }
        if perm.contains(MulPerm::KE) {
            flags &= !PF_US;
        }
        if perm.contains(MulPerm::CD) || perm.contains(MulPerm::DEV) {
            flags |= PF_CD;
        }
        if perm.contains(MulPerm::WT) {
            flags |= PF_WT;
        }
        if perm.contains(MulPerm::X) {
            flags &= !PF_NX;
        }
        if perm.contains(MulPerm::WC) {
            if feats.contains(CpuFeatures::PAT) {
                // PAT4 is WC; PCD/PWT select other PAT entries
                flags |= PF_WC;
                flags &= !(PF_CD | PF_WT);
            } else {
                // Without PAT, WC degrades to WT
                flags |= PF_WT;
            }
        }
        flags
    }

    fn flush_addr(&self, space: &Arc<MmSpace>, addr: usize) {
        let is_current = kernel_space_opt()
            .map(|k| Arc::ptr_eq(k, space))
            .unwrap_or(false);
        if is_current {
            cpu::invlpg(addr);
        } else {
            // Foreign space: flush lazily on its next activation
            space
                .mul
                .tlb_update_pending
                .store(true, core::sync::atomic::Ordering::SeqCst);
        }
    }

    /// Clears the back-mapping of the page at `pfn` for (space, addr).
    fn drop_back_mapping(&self, space: &Arc<MmSpace>, addr: usize, pte: u64) {
        let page = page::find_page_pfn((pte & PT_FRAME) >> PAGE_SHIFT);
        page.remove_mapping(space, addr);
        space
            .stats
            .num_maps
            .fetch_sub(1, core::sync::atomic::Ordering::Relaxed);
    }

    /// Rewrites every alias of `page` through its back-mapping list.
    fn for_each_mapping(
        &self,
        pg: &Arc<Page>,
        mut f: impl FnMut(&Arc<MmSpace>, usize, u64) -> Option<u64>,
    ) {
        for mapping in pg.mappings() {
            let space = match mapping.space.upgrade() {
                Some(s) => s,
                None => continue,
            };
            let cur = kernel_space();
            let mut cache_guard = cur.mul.cache.lock();
            let cache = cache_guard.as_mut().expect("MUL cache not initialized");
            let _space_guard = space.mul.lock.lock();
            let vaddr = decanonical(mapping.addr);
            let slot = ptab::walk(cache, self, space.mul.root(), vaddr);
            let tv = cache.slot_addr(slot);
            let idx = self.idx_level(vaddr, 1);
            let pte = self.read_pte(tv, idx);
            if pte != 0 {
                if let Some(new) = f(&space, mapping.addr, pte) {
                    self.write_pte(tv, idx, new);
                    self.flush_addr(&space, mapping.addr);
                }
            }
            cache.return_slot(slot);
        }
    }
}

impl PtabOps for X64Mul {
    fn levels(&self) -> u8 {
        NUM_LEVELS
    }

    fn idx_level(&self, vaddr: usize, level: u8) -> usize {
        (vaddr >> IDX_SHIFT[level as usize]) & IDX_MASK
    }

    fn read_pte(&self, table_virt: usize, idx: usize) -> u64 {
        unsafe { core::ptr::read_volatile((table_virt as *const u64).add(idx)) }
    }

    fn write_pte(&self, table_virt: usize, idx: usize, pte: u64) {
        unsafe { core::ptr::write_volatile((table_virt as *mut u64).add(idx), pte) }
    }

    fn pte_frame(&self, pte: u64) -> PhysAddr {
        pte & PT_FRAME
    }

    fn map_cache_slot(&self, slot: &PtCacheSlot, tab: PhysAddr) {
        unsafe {
            core::ptr::write_volatile(slot.pte_addr as *mut u64, tab | PF_P | PF_RW);
        }
        cpu::invlpg(slot.addr);
    }

    fn verify(&self, parent_pte: u64, leaf_pte: u64) {
        if parent_pte & PF_US == 0 && leaf_pte & PF_US != 0 {
            panic!("can't map user mapping into kernel memory");
        }
    }

    fn alloc_table(&self, space: &MmSpace, cache: &mut PtCache, _vaddr: usize) -> PhysAddr {
        // Table pages are fixed for their lifetime; failure is fatal
        // because the caller cannot back out of a half-done walk
        let pg = match page::page_sys().alloc_fixed_page() {
            Some(p) => p,
            None => crate::klib::panic::oom(),
        };
        let phys = pg.phys();
        let slot = cache.get(self, phys, PTAB_UNCACHED);
        unsafe {
            core::ptr::write_bytes(cache.slot_addr(slot) as *mut u8, 0, PAGE_SIZE);
        }
        cache.free_to_cache(slot);
        space.mul.page_list.lock().push(pg);
        phys
    }

    fn table_pte(&self, vaddr: usize, _leaf_pte: u64, tab: PhysAddr) -> u64 {
        let mut flags = PF_P | PF_RW;
        if !is_kernel(make_canonical(vaddr)) {
            flags |= PF_US;
        }
        tab | flags
    }
}

impl MulBackend for X64Mul {
    fn init(&self) {
        crate::debug!("mul: initializing, {} levels", NUM_LEVELS);
        let root = cpu::read_cr3();
        // Back the cache window PT: map a dummy page at the window base
        // so the intermediate tables exist, then find the leaf table and
        // map it at TABLE_BASE for direct PTE access
        self.map_early(
            PTCACHE_BASE,
            0,
            MulPerm::R | MulPerm::RW | MulPerm::KE,
        );
        let mut table = root;
        let base = decanonical(PTCACHE_BASE);
        for level in (3..=NUM_LEVELS).rev() {
            let ent = unsafe {
                core::ptr::read_volatile(
                    (table as *const u64).add(self.idx_level(base, level)),
                )
            };
            assert!(ent != 0, "cache window tables missing");
            table = ent & PT_FRAME;
        }
        let leaf_tab = unsafe {
            core::ptr::read_volatile((table as *const u64).add(self.idx_level(base, 2)))
        } & PT_FRAME;
        self.map_early(
            PTCACHE_TABLE_BASE,
            leaf_tab,
            MulPerm::R | MulPerm::RW | MulPerm::KE,
        );
        // Flush everything the early maps touched
        unsafe {
            cpu::write_cr3(root);
        }
        // Publish the kernel MUL space and its cache
        let kspace = kernel_space();
        kspace.mul.set_root(root);
        let mut windows = alloc::vec::Vec::with_capacity(MAX_PTCACHE);
        for i in 0..MAX_PTCACHE {
            let addr = PTCACHE_BASE + i * PAGE_SIZE;
            let pte_addr = PTCACHE_TABLE_BASE + self.idx_level(decanonical(addr), 1) * 8;
            windows.push((addr, pte_addr));
        }
        *kspace.mul.cache.lock() = Some(PtCache::new(&windows));
        // Write combining through the PAT if the CPU has it
        if self.feats().contains(CpuFeatures::PAT) {
            let pat = (PAT_WB << 0)
                | (PAT_WT << 8)
                | (PAT_UC_MINUS << 16)
                | (PAT_UC << 24)
                | (PAT_WC << 32);
            unsafe {
                cpu::wrmsr(PAT_MSR, pat);
            }
        }
    }

    fn map_early(&self, virt: usize, phys: PhysAddr, perm: MulPerm) {
        let vaddr = decanonical(virt);
        let mut flags = PF_P | PF_US;
        if perm.contains(MulPerm::RW) {
            flags |= PF_RW;
        }
        if perm.contains(MulPerm::KE) {
            flags &= !PF_US;
        }
        if perm.contains(MulPerm::CD) || perm.contains(MulPerm::DEV) {
            flags |= PF_CD;
        }
        if perm.contains(MulPerm::WT) {
            flags |= PF_WT;
        }
        let mut table = cpu::read_cr3();
        for level in (2..=NUM_LEVELS).rev() {
            let idx = self.idx_level(vaddr, level);
            let ent = unsafe { core::ptr::read_volatile((table as *const u64).add(idx)) };
            if ent != 0 {
                table = ent & PT_FRAME;
            } else {
                // Fresh table out of the pre-mapped boot arena
                let tab_virt = match crate::mm::kvm::alloc_kv_page() {
                    Some(v) => v,
                    None => crate::klib::panic::oom(),
                };
                let tab_phys = self.get_phys_early(tab_virt);
                unsafe {
                    core::ptr::write_bytes(tab_virt as *mut u8, 0, PAGE_SIZE);
                }
                let mut tab_flags = PF_P | PF_RW;
                if flags & PF_US != 0 {
                    tab_flags |= PF_US;
                }
                unsafe {
                    core::ptr::write_volatile(
                        (table as *mut u64).add(idx),
                        tab_phys | tab_flags,
                    );
                }
                table = tab_phys;
            }
        }
        let leaf = unsafe { (table as *mut u64).add(self.idx_level(vaddr, 1)) };
        unsafe {
            if core::ptr::read_volatile(leaf) != 0 {
                panic!("cannot map already mapped page");
            }
            core::ptr::write_volatile(leaf, flags | phys);
        }
        cpu::invlpg(virt);
    }

    fn get_phys_early(&self, virt: usize) -> PhysAddr {
        let vaddr = decanonical(virt);
        let mut table = cpu::read_cr3();
        for level in (2..=NUM_LEVELS).rev() {
            let ent = unsafe {
                core::ptr::read_volatile((table as *const u64).add(self.idx_level(vaddr, level)))
            };
            if ent == 0 {
                panic!("cannot get physical address of non-existent page");
            }
            table = ent & PT_FRAME;
        }
        let pte = unsafe {
            core::ptr::read_volatile((table as *const u64).add(self.idx_level(vaddr, 1)))
        };
        pte & PT_FRAME
    }

    fn create_space(&self, _space: &MmSpace) {
        // User spaces are outside the core; the kernel space root comes
        // from the bootloader's tables in init
    }

    fn ref_space(&self, space: &MmSpace) {
        space
            .mul
            .ref_count
            .fetch_add(1, core::sync::atomic::Ordering::SeqCst);
    }

    fn deref_space(&self, space: &MmSpace) {
        if let Some(kspace) = kernel_space_opt() {
            if core::ptr::eq(&**kspace as *const MmSpace, space as *const MmSpace) {
                panic!("can't destroy kernel space");
            }
        }
        let left = space
            .mul
            .ref_count
            .fetch_sub(1, core::sync::atomic::Ordering::SeqCst)
            - 1;
        if left == 0 {
            // Tear the tables down: every table page is fixed exactly
            // once by alloc_table
            let sys = page::page_sys();
            let pages: alloc::vec::Vec<Arc<Page>> =
                space.mul.page_list.lock().drain(..).collect();
            for pg in pages {
                sys.unfix_page(&pg);
                sys.free_page(&pg);
            }
            let root = space.mul.root();
            if root != 0 {
                let root_pg = sys.find_page_pfn(root >> PAGE_SHIFT);
                if !root_pg.flags().contains(PageFlags::UNUSABLE) {
                    sys.free_page(&root_pg);
                }
                space.mul.set_root(0);
            }
        }
    }

    fn map_page(&self, space: &Arc<MmSpace>, virt: usize, pg: &Arc<Page>, perm: MulPerm) {
        let fixed = pg.flags().contains(PageFlags::FIXED);
        let mut new_pte = self.prot_flags(perm) | pg.phys();
        if fixed {
            new_pte |= PF_F;
        }
        if self.feats().contains(CpuFeatures::PGE) && is_kernel(virt) {
            new_pte |= PF_G;
        }
        let vaddr = decanonical(virt);
        let mut old_mapping: Option<u64> = None;
        {
            let cur = kernel_space();
            let mut cache_guard = cur.mul.cache.lock();
            let cache = cache_guard.as_mut().expect("MUL cache not initialized");
            let _space_guard = space.mul.lock.lock();
            let slot =
                ptab::walk_and_map(space, cache, self, space.mul.root(), vaddr, new_pte);
            let tv = cache.slot_addr(slot);
            let idx = self.idx_level(vaddr, 1);
            let old = self.read_pte(tv, idx);
            if old != 0 {
                if old & PF_F != 0 {
                    panic!("attempt to replace fixed mapping");
                }
                if new_pte & PF_F != 0 {
                    space
                        .stats
                        .num_fixed
                        .fetch_add(1, core::sync::atomic::Ordering::Relaxed);
                }
                if old & PT_FRAME != new_pte & PT_FRAME {
                    old_mapping = Some(old);
                }
                self.write_pte(tv, idx, new_pte);
                self.flush_addr(space, virt);
            } else {
                if new_pte & PF_F != 0 {
                    space
                        .stats
                        .num_fixed
                        .fetch_add(1, core::sync::atomic::Ordering::Relaxed);
                }
                self.write_pte(tv, idx, new_pte);
            }
            cache.return_slot(slot);
        }
        // Back-mapping updates happen outside the table locks: space
        // lock, then page lock. Fixed pages are tracked too, so the
        // fixed bit can be wired and unwired through every alias.
        if let Some(old) = old_mapping {
            self.drop_back_mapping(space, virt, old);
        }
        pg.add_mapping(space, virt);
        space
            .stats
            .num_maps
            .fetch_add(1, core::sync::atomic::Ordering::Relaxed);
    }

    fn unmap_range(&self, space: &Arc<MmSpace>, base: usize, count: usize) {
        let cur = kernel_space();
        let mut cache_guard = cur.mul.cache.lock();
        let cache = cache_guard.as_mut().expect("MUL cache not initialized");
        let _space_guard = space.mul.lock.lock();
        let mut iter = ptab::PtIter::new(space.mul.root(), decanonical(base));
        for _ in 0..count {
            let addr = iter.addr;
            let slot = match iter.next(cache, self) {
                Some(s) => s,
                None => continue,
            };
            let tv = cache.slot_addr(slot);
            let idx = self.idx_level(addr, 1);
            let pte = self.read_pte(tv, idx);
            if pte != 0 {
                if pte & PF_F != 0 {
                    panic!("can't remove fixed mapping");
                }
                self.write_pte(tv, idx, 0);
                self.flush_addr(space, make_canonical(addr));
                self.drop_back_mapping(space, make_canonical(addr), pte);
            }
        }
        iter.end(cache);
    }

    fn protect_range(&self, space: &Arc<MmSpace>, base: usize, count: usize, perm: MulPerm) {
        let flags = self.prot_flags(perm);
        let cur = kernel_space();
        let mut cache_guard = cur.mul.cache.lock();
        let cache = cache_guard.as_mut().expect("MUL cache not initialized");
        let _space_guard = space.mul.lock.lock();
        let mut iter = ptab::PtIter::new(space.mul.root(), decanonical(base));
        for _ in 0..count {
            let addr = iter.addr;
            let slot = match iter.next(cache, self) {
                Some(s) => s,
                None => continue,
            };
            let tv = cache.slot_addr(slot);
            let idx = self.idx_level(addr, 1);
            let pte = self.read_pte(tv, idx);
            if pte & PF_P != 0 {
                self.write_pte(tv, idx, (pte & PT_FRAME) | flags | (pte & PF_F));
                self.flush_addr(space, make_canonical(addr));
            }
        }
        iter.end(cache);
    }

    fn unmap_page(&self, pg: &Arc<Page>) {
        self.for_each_mapping(pg, |space, _addr, pte| {
            if pte & PF_F != 0 {
                panic!("can't unmap fixed mapping");
            }
            space
                .stats
                .num_maps
                .fetch_sub(1, core::sync::atomic::Ordering::Relaxed);
            Some(0)
        });
        pg.clear_mappings();
    }

    fn protect_page(&self, pg: &Arc<Page>, perm: MulPerm) {
        let flags = self.prot_flags(perm);
        self.for_each_mapping(pg, |_space, _addr, pte| {
            Some((pte & PT_FRAME) | flags | (pte & PF_F))
        });
    }

    fn fix_page(&self, pg: &Arc<Page>) {
        self.for_each_mapping(pg, |space, _addr, pte| {
            if pte & PF_F == 0 {
                space
                    .stats
                    .num_fixed
                    .fetch_add(1, core::sync::atomic::Ordering::Relaxed);
            }
            Some(pte | PF_F)
        });
    }

    fn unfix_page(&self, pg: &Arc<Page>) {
        self.for_each_mapping(pg, |space, _addr, pte| {
            if pte & PF_F != 0 {
                space
                    .stats
                    .num_fixed
                    .fetch_sub(1, core::sync::atomic::Ordering::Relaxed);
            }
            Some(pte & !PF_F)
        });
    }

    fn get_mapping(&self, space: &Arc<MmSpace>, virt: usize) -> Option<Arc<Page>> {
        let vaddr = decanonical(virt);
        let cur = kernel_space();
        let mut cache_guard = cur.mul.cache.lock();
        let cache = cache_guard.as_mut().expect("MUL cache not initialized");
        let _space_guard = space.mul.lock.lock();
        let slot = ptab::walk(cache, self, space.mul.root(), vaddr);
        let tv = cache.slot_addr(slot);
        let pte = self.read_pte(tv, self.idx_level(vaddr, 1));
        cache.return_slot(slot);
        if pte == 0 {
            return None;
        }
        Some(page::find_page_pfn((pte & PT_FRAME) >> PAGE_SHIFT))
    }

    fn zero_page(&self, pg: &Page) {
        let cur = kernel_space();
        let mut cache_guard = cur.mul.cache.lock();
        let cache = cache_guard.as_mut().expect("MUL cache not initialized");
        let slot = cache.get(self, pg.phys(), PTAB_UNCACHED);
        unsafe {
            core::ptr::write_bytes(cache.slot_addr(slot) as *mut u8, 0, PAGE_SIZE);
        }
        cache.free_to_cache(slot);
    }

    fn get_attr(&self, space: &Arc<MmSpace>, virt: usize, attr: MulAttr) -> bool {
        let vaddr = decanonical(virt);
        let cur = kernel_space();
        let mut cache_guard = cur.mul.cache.lock();
        let cache = cache_guard.as_mut().expect("MUL cache not initialized");
        let _space_guard = space.mul.lock.lock();
        let slot = ptab::walk(cache, self, space.mul.root(), vaddr);
        let tv = cache.slot_addr(slot);
        let pte = self.read_pte(tv, self.idx_level(vaddr, 1));
        cache.return_slot(slot);
        match attr {
            MulAttr::Access => pte & PF_A != 0,
            MulAttr::Dirty => pte & PF_D != 0,
        }
    }

    fn set_attr(&self, space: &Arc<MmSpace>, virt: usize, attr: MulAttr, val: bool) {
        let vaddr = decanonical(virt);
        let cur = kernel_space();
        let mut cache_guard = cur.mul.cache.lock();
        let cache = cache_guard.as_mut().expect("MUL cache not initialized");
        let _space_guard = space.mul.lock.lock();
        let slot = ptab::walk(cache, self, space.mul.root(), vaddr);
        let tv = cache.slot_addr(slot);
        let idx = self.idx_level(vaddr, 1);
        let pte = self.read_pte(tv, idx);
        if pte != 0 {
            let bit = match attr {
                MulAttr::Access => PF_A,
                MulAttr::Dirty => PF_D,
            };
            let new = if val { pte | bit } else { pte & !bit };
            self.write_pte(tv, idx, new);
            self.flush_addr(space, virt);
        }
        cache.return_slot(slot);
    }
}
