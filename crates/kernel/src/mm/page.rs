// Physical page frame manager. RAM is described by zones built from the
// boot memory map; every allocatable frame has a Page in its zone's PFN
// map. Pages belonging to a memory object are additionally tracked in a
// hash keyed by (object, offset).

use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use spin::{Mutex, Once};

use super::object::MemObject;
use super::space::MmSpace;
use super::{mul, Pfn, PAGE_SHIFT, PAGE_SIZE, PFNMAP_BASE, PFNMAP_MAX};
use crate::klib::bootinfo::{MemEntry, MemType};

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ZoneFlags: u32 {
        const KERNEL      = 1 << 0;
        const MMIO        = 1 << 1;
        const RESVD       = 1 << 2;
        const RECLAIM     = 1 << 3;
        const ALLOCATABLE = 1 << 4;
        /// Generic allocations are banned (ISA DMA / 32-bit device zones).
        const NO_GENERIC  = 1 << 5;
    }
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u32 {
        /// On its zone's free list
        const FREE      = 1 << 0;
        /// Owned by a memory object
        const IN_OBJECT = 1 << 1;
        /// No frame backing (MMIO mirror / guard); not allocator-managed
        const UNUSABLE  = 1 << 2;
        /// Allocated but not yet in an object
        const ALLOCED   = 1 << 3;
        /// Marker page: never map anything at its (object, offset)
        const GUARD     = 1 << 4;
        /// Pinned; the pager must not steal it and mappings must stay
        const FIXED     = 1 << 5;
    }
}

/// A back-mapping: one (address space, virtual address) alias of a page.
#[derive(Clone)]
pub struct PageMapping {
    pub space: Weak<MmSpace>,
    pub addr: usize,
}

/// Owning-object reference of an IN_OBJECT page.
#[derive(Clone)]
pub struct PageObjRef {
    pub obj: Weak<MemObject>,
    pub obj_id: u64,
    pub offset: usize,
}

pub struct PageState {
    pub flags: PageFlags,
    pub fix_count: u32,
    pub obj: Option<PageObjRef>,
    pub maps: Vec<PageMapping>,
}

/// One physical page frame (or a forged stand-in for MMIO/guard use).
pub struct Page {
    pfn: Pfn,
    /// Index of the owning zone; `None` for forged pages.
    zone: Option<usize>,
    state: Mutex<PageState>,
}

impl Page {
    fn new(pfn: Pfn, zone: usize) -> Self {
        Self {
            pfn,
            zone: Some(zone),
            state: Mutex::new(PageState {
                flags: PageFlags::FREE,
                fix_count: 0,
                obj: None,
                maps: Vec::new(),
            }),
        }
    }

    fn fake(pfn: Pfn, flags: PageFlags) -> Self {
        Self {
            pfn,
            zone: None,
            state: Mutex::new(PageState {
                flags,
                fix_count: 0,
                obj: None,
                maps: Vec::new(),
            }),
        }
    }

    pub fn pfn(&self) -> Pfn {
        self.pfn
    }

    pub fn phys(&self) -> super::PhysAddr {
        self.pfn * PAGE_SIZE as u64
    }

    pub fn zone_idx(&self) -> Option<usize> {
        self.zone
    }

    pub fn lock(&self) -> spin::MutexGuard<'_, PageState> {
        self.state.lock()
    }

    pub fn flags(&self) -> PageFlags {
        self.state.lock().flags
    }

    pub fn fix_count(&self) -> u32 {
        self.state.lock().fix_count
    }

    /// Records a back-mapping. Fixed and unusable pages are not tracked;
    /// the MUL skips them before calling here.
    pub fn add_mapping(&self, space: &Arc<MmSpace>, addr: usize) {
        self.state.lock().maps.push(PageMapping {
            space: Arc::downgrade(space),
            addr,
        });
    }

    /// Drops the back-mapping for (space, addr) if present.
    pub fn remove_mapping(&self, space: &Arc<MmSpace>, addr: usize) {
        let mut state = self.state.lock();
        state
            .maps
            .retain(|m| !(m.addr == addr && m.space.as_ptr() == Arc::as_ptr(space)));
    }

    /// Snapshot of the back-mapping list.
    pub fn mappings(&self) -> Vec<PageMapping> {
        self.state.lock().maps.clone()
    }

    pub fn clear_mappings(&self) {
        self.state.lock().maps.clear();
    }
}

struct ZoneState {
    free_count: usize,
    /// Indices into the zone's PFN map; LIFO.
    free_list: Vec<u32>,
}

/// A contiguous range of physical frames sharing one memory type.
pub struct Zone {
    pfn: Pfn,
    num_pages: usize,
    flags: ZoneFlags,
    pfn_map: Vec<Arc<Page>>,
    state: Mutex<ZoneState>,
}

impl Zone {
    pub fn base_pfn(&self) -> Pfn {
        self.pfn
    }

    pub fn num_pages(&self) -> usize {
        self.num_pages
    }

    pub fn flags(&self) -> ZoneFlags {
        self.flags
    }

    pub fn free_count(&self) -> usize {
        self.state.lock().free_count
    }

    fn will_work(&self, max_pfn: Pfn, needed: usize, banned: ZoneFlags) -> bool {
        if self.flags.intersects(banned) || !self.flags.contains(ZoneFlags::ALLOCATABLE) {
            return false;
        }
        // A zone spanning above the limit is rejected entirely
        if self.pfn + self.num_pages as u64 > max_pfn {
            return false;
        }
        self.state.lock().free_count >= needed
    }
}

struct Bucket {
    list: Mutex<Vec<Arc<Page>>>,
}

/// The page frame manager. One global instance serves the kernel; tests
/// build private instances from synthetic memory maps.
pub struct PageSys {
    zones: Vec<Zone>,
    hash: Vec<Bucket>,
    nbuckets: usize,
    free_hint: AtomicUsize,
    num_pages: AtomicU64,
    free_pages: AtomicU64,
    fixed_pages: AtomicU64,
}

/// Zone descriptor used while the zone list is being shaped, before PFN
/// maps are materialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ZoneDesc {
    pfn: Pfn,
    num_pages: usize,
    flags: ZoneFlags,
}

fn zones_overlap(a: &ZoneDesc, b: &ZoneDesc) -> bool {
    // Touching is not overlapping; sharing a frame is.
    let a_end = a.pfn + a.num_pages as u64;
    let b_end = b.pfn + b.num_pages as u64;
    a.pfn < b_end && b.pfn < a_end
}

fn desc_insert(zones: &mut Vec<ZoneDesc>, zone: ZoneDesc) {
    for existing in zones.iter() {
        if zones_overlap(existing, &zone) {
            crate::warn!(
                "mm: ignoring overlapping memory region at pfn {:#x}",
                zone.pfn
            );
            return;
        }
    }
    let pos = zones
        .iter()
        .position(|z| zone.pfn < z.pfn)
        .unwrap_or(zones.len());
    zones.insert(pos, zone);
}

/// Merges adjacent descriptors with identical flags. Only valid during
/// bootstrap while every zone is wholly free.
fn desc_merge(zones: &mut Vec<ZoneDesc>) {
    let mut i = 1;
    while i < zones.len() {
        let prev = zones[i - 1];
        let cur = zones[i];
        if prev.pfn + prev.num_pages as u64 == cur.pfn && prev.flags == cur.flags {
            zones[i - 1].num_pages += cur.num_pages;
            zones.remove(i);
        } else {
            i += 1;
        }
    }
}

/// Splits the descriptor containing `split_pfn` in two, giving the lower
/// part `low_flags`.
fn desc_split_at(zones: &mut Vec<ZoneDesc>, split_pfn: Pfn, low_flags: ZoneFlags) {
    for i in 0..zones.len() {
        let z = zones[i];
        let end = z.pfn + z.num_pages as u64;
        if z.pfn < split_pfn && end > split_pfn {
            let low_pages = (split_pfn - z.pfn) as usize;
            zones[i].num_pages = low_pages;
            zones[i].flags = low_flags;
            let high = ZoneDesc {
                pfn: split_pfn,
                num_pages: z.num_pages - low_pages,
                flags: z.flags,
            };
            zones.insert(i + 1, high);
            return;
        }
    }
}

/// PC zone policy: the [0, 16M) ISA-DMA window and the [0, 4G) window for
/// 32-bit devices each get standalone NO_GENERIC zones so bounded
/// allocations can always be satisfied.
fn apply_pc_policy(zones: &mut Vec<ZoneDesc>) {
    const PFN_16M: Pfn = (0x100_0000usize >> PAGE_SHIFT) as Pfn;
    const PFN_4G: Pfn = (0x1_0000_0000usize >> PAGE_SHIFT) as Pfn;
    // ISA DMA window: the first allocatable zone under 16M becomes a
    // dedicated zone, split at the boundary if it juts past it
    for i in 0..zones.len() {
        let z = zones[i];
        if !z.flags.contains(ZoneFlags::ALLOCATABLE) {
            continue;
        }
        let end = z.pfn + z.num_pages as u64;
        if end <= PFN_16M && z.pfn < PFN_16M {
            zones[i].flags |= ZoneFlags::NO_GENERIC;
            break;
        } else if z.pfn < PFN_16M && end > PFN_16M {
            desc_split_at(zones, PFN_16M, z.flags | ZoneFlags::NO_GENERIC);
            break;
        }
    }
    // 32-bit device window: a zone straddling 4G gets split so the low
    // part stays reachable for 32-bit DMA
    for i in 0..zones.len() {
        let z = zones[i];
        if !z.flags.contains(ZoneFlags::ALLOCATABLE) {
            continue;
        }
        let end = z.pfn + z.num_pages as u64;
        if z.pfn < PFN_4G && end > PFN_4G {
            desc_split_at(zones, PFN_4G, z.flags | ZoneFlags::NO_GENERIC);
            break;
        }
    }
}

impl PageSys {
    /// Builds the page layer from a boot memory map. Reserves physical
    /// space for the PFN map by trimming the tail of a suitable FREE
    /// entry and publishes it at the PFN map window.
    pub fn new(mem_map: &[MemEntry]) -> PageSys {
        let mut map: Vec<MemEntry> = mem_map.to_vec();
        // Step 1: usable PFN count, capped by the PFN map window
        let max_pfns = PFNMAP_MAX / core::mem::size_of::<Page>();
        let mut num_pfns: usize = 0;
        let mut last_ent = map.len();
        for (i, ent) in map.iter().enumerate() {
            if ent.size == 0 || !is_allocatable_type(ent.kind) {
                continue;
            }
            num_pfns += (ent.size as usize + PAGE_SIZE - 1) / PAGE_SIZE;
            if num_pfns >= max_pfns {
                num_pfns = max_pfns;
                last_ent = i + 1;
                break;
            }
        }
        // Step 2: hash size, the greatest power of two <= pfns / 2
        let mut nbuckets = 1usize;
        while nbuckets * 2 <= num_pfns / 2 {
            nbuckets <<= 1;
        }
        // Step 3: reserve physical space for the PFN map and hash, taken
        // off the tail of a FREE entry (reclaim regions stay untouched
        // this early)
        let map_size = num_pfns * core::mem::size_of::<Page>()
            + nbuckets * core::mem::size_of::<Bucket>();
        let map_size = super::page_align_up(map_size);
        let mut reserved = false;
        for ent in map[..last_ent].iter_mut() {
            if ent.kind == MemType::Free && ent.size as usize > map_size {
                ent.size -= map_size as u64;
                let phys = ent.base + ent.size;
                for i in 0..(map_size / PAGE_SIZE) {
                    mul::map_early(
                        PFNMAP_BASE + i * PAGE_SIZE,
                        phys + (i * PAGE_SIZE) as u64,
                        mul::MulPerm::R | mul::MulPerm::RW | mul::MulPerm::KE,
                    );
                }
                crate::debug!(
                    "mm: reserved PFN map from {:#x} to {:#x}",
                    phys,
                    phys + map_size as u64
                );
                reserved = true;
                break;
            }
        }
        if !reserved {
            panic!("no memory for PFN map");
        }
        // Step 4: shape the zone list
        let mut descs: Vec<ZoneDesc> = Vec::new();
        for ent in map[..last_ent].iter() {
            if ent.size == 0 {
                continue;
            }
            let flags = match ent.kind {
                MemType::Reserved | MemType::AcpiNvs => ZoneFlags::RESVD,
                MemType::Mmio => ZoneFlags::MMIO,
                MemType::AcpiReclaim => ZoneFlags::RECLAIM,
                MemType::Free | MemType::FwReclaim | MemType::BootReclaim => {
                    ZoneFlags::ALLOCATABLE
                }
            };
            desc_insert(
                &mut descs,
                ZoneDesc {
                    pfn: ent.base >> PAGE_SHIFT,
                    num_pages: ent.size as usize >> PAGE_SHIFT,
                    flags,
                },
            );
        }
        desc_merge(&mut descs);
        #[cfg(target_arch = "x86_64")]
        apply_pc_policy(&mut descs);
        Self::from_descs(descs, nbuckets)
    }

    fn from_descs(descs: Vec<ZoneDesc>, nbuckets: usize) -> PageSys {
        let mut zones = Vec::with_capacity(descs.len());
        let mut total: u64 = 0;
        for (idx, d) in descs.iter().enumerate() {
            let mut pfn_map = Vec::new();
            let mut free_list = Vec::new();
            let mut free_count = 0;
            if d.flags.contains(ZoneFlags::ALLOCATABLE) {
                pfn_map.reserve_exact(d.num_pages);
                free_list.reserve_exact(d.num_pages);
                for i in 0..d.num_pages {
                    pfn_map.push(Arc::new(Page::new(d.pfn + i as u64, idx)));
                    // LIFO pop order matches the add-front free list
                    free_list.push((d.num_pages - 1 - i) as u32);
                }
                free_count = d.num_pages;
                total += d.num_pages as u64;
            }
            zones.push(Zone {
                pfn: d.pfn,
                num_pages: d.num_pages,
                flags: d.flags,
                pfn_map,
                state: Mutex::new(ZoneState {
                    free_count,
                    free_list,
                }),
            });
        }
        // Free hint: the allocatable zone with the most free pages that
        // allows generic allocations
        let mut hint = 0;
        let mut best = 0usize;
        for (i, z) in zones.iter().enumerate() {
            if z.flags.contains(ZoneFlags::ALLOCATABLE)
                && !z.flags.contains(ZoneFlags::NO_GENERIC)
                && z.num_pages > best
            {
                best = z.num_pages;
                hint = i;
            }
        }
        let mut hash = Vec::with_capacity(nbuckets);
        for _ in 0..nbuckets {
            hash.push(Bucket {
                list: Mutex::new(Vec::new()),
            });
        }
        crate::info!(
            "mm: found {}M of usable memory in {} zones",
            (total as usize * PAGE_SIZE) / 1024 / 1024,
            zones.len()
        );
        PageSys {
            zones,
            hash,
            nbuckets,
            free_hint: AtomicUsize::new(hint),
            num_pages: AtomicU64::new(total),
            free_pages: AtomicU64::new(total),
            fixed_pages: AtomicU64::new(0),
        }
    }

    pub fn zones(&self) -> &[Zone] {
        &self.zones
    }

    pub fn total_pages(&self) -> u64 {
        self.num_pages.load(Ordering::Relaxed)
    }

    pub fn free_pages(&self) -> u64 {
        self.free_pages.load(Ordering::Relaxed)
    }

    pub fn fixed_pages(&self) -> u64 {
        self.fixed_pages.load(Ordering::Relaxed)
    }

    fn find_best_zone(&self, max_pfn: Pfn, needed: usize, banned: ZoneFlags) -> Option<usize> {
        let max_pfn = if max_pfn == 0 { Pfn::MAX } else { max_pfn };
        let hint = self.free_hint.load(Ordering::Relaxed);
        if let Some(z) = self.zones.get(hint) {
            if z.will_work(max_pfn, needed, banned) {
                return Some(hint);
            }
        }
        for (i, z) in self.zones.iter().enumerate() {
            if z.will_work(max_pfn, needed, banned) {
                return Some(i);
            }
        }
        None
    }

    fn zone_by_pfn(&self, pfn: Pfn) -> Option<usize> {
        self.zones
            .iter()
            .position(|z| z.pfn <= pfn && z.pfn + z.num_pages as u64 > pfn)
    }

    /// Allocates one frame from generic memory. Returns `None` on
    /// exhaustion; callers that cannot proceed panic.
    pub fn alloc_page(&self) -> Option<Arc<Page>> {
        let zone_idx = self.find_best_zone(0, 1, ZoneFlags::NO_GENERIC)?;
        let zone = &self.zones[zone_idx];
        let page = {
            let mut state = zone.state.lock();
            let idx = state.free_list.pop()?;
            state.free_count -= 1;
            zone.pfn_map[idx as usize].clone()
        };
        self.free_pages.fetch_sub(1, Ordering::Relaxed);
        page.state.lock().flags = PageFlags::ALLOCED;
        Some(page)
    }

    /// Allocates a frame and fixes it.
    pub fn alloc_fixed_page(&self) -> Option<Arc<Page>> {
        let page = self.alloc_page()?;
        self.fix_page(&page);
        Some(page)
    }

    /// Allocates `count` contiguous frames aligned to `align` bytes below
    /// `max_addr`. Linear scan over the PFN map; only for DMA-bounded
    /// buffers.
    pub fn alloc_pages_at(
        &self,
        count: usize,
        max_addr: u64,
        align: u64,
    ) -> Option<Vec<Arc<Page>>> {
        let align_pfn = core::cmp::max(1, align as usize >> PAGE_SHIFT) as u64;
        let zone_idx = self.find_best_zone(max_addr >> PAGE_SHIFT, count, ZoneFlags::empty())?;
        let zone = &self.zones[zone_idx];
        let mut state = zone.state.lock();
        let n = zone.pfn_map.len();
        let mut start = 0usize;
        // Start at the first aligned frame of the zone
        while (zone.pfn + start as u64) % align_pfn != 0 {
            start += 1;
        }
        let mut i = start;
        while i + count <= n {
            let run_free = (i..i + count)
                .all(|j| zone.pfn_map[j].state.lock().flags.contains(PageFlags::FREE));
            if run_free {
                let taken: Vec<u32> = (i as u32..(i + count) as u32).collect();
                state.free_list.retain(|idx| !taken.contains(idx));
                state.free_count -= count;
                drop(state);
                self.free_pages.fetch_sub(count as u64, Ordering::Relaxed);
                let mut pages = Vec::with_capacity(count);
                for j in i..i + count {
                    let page = zone.pfn_map[j].clone();
                    page.state.lock().flags = PageFlags::ALLOCED;
                    pages.push(page);
                }
                return Some(pages);
            }
            i += align_pfn as usize;
        }
        None
    }

    /// Frees a page. Forged pages simply drop; frames go back to their
    /// zone's free list.
    pub fn free_page(&self, page: &Arc<Page>) {
        let mut state = page.state.lock();
        if state.fix_count != 0 {
            panic!("can't free fixed page");
        }
        if state.flags.contains(PageFlags::FREE) {
            panic!("double free of pfn {:#x}", page.pfn);
        }
        if state.flags.contains(PageFlags::UNUSABLE) && page.zone.is_none() {
            return; // dropped by the caller's Arc
        }
        let zone_idx = page.zone.expect("page without zone");
        let zone = &self.zones[zone_idx];
        state.flags = PageFlags::FREE;
        state.obj = None;
        state.maps.clear();
        drop(state);
        let mut zstate = zone.state.lock();
        zstate.free_list.push((page.pfn - zone.pfn) as u32);
        zstate.free_count += 1;
        drop(zstate);
        self.free_pages.fetch_add(1, Ordering::Relaxed);
    }

    /// Frees a run from `alloc_pages_at`.
    pub fn free_page_run(&self, pages: &[Arc<Page>]) {
        for page in pages {
            self.free_page(page);
        }
    }

    /// Returns the Page for a PFN. PFNs outside allocatable zones get a
    /// forged UNUSABLE page carrying just the frame number (MMIO use).
    pub fn find_page_pfn(&self, pfn: Pfn) -> Arc<Page> {
        if let Some(zi) = self.zone_by_pfn(pfn) {
            let zone = &self.zones[zi];
            if zone.flags.contains(ZoneFlags::ALLOCATABLE) {
                let page = zone.pfn_map[(pfn - zone.pfn) as usize].clone();
                assert_eq!(page.pfn, pfn);
                return page;
            }
        }
        Arc::new(Page::fake(pfn, PageFlags::UNUSABLE))
    }

    /// Forges a guard page: never mapped, marks an (object, offset) as
    /// off limits.
    pub fn alloc_guard_page(&self) -> Arc<Page> {
        Arc::new(Page::fake(0, PageFlags::UNUSABLE | PageFlags::GUARD))
    }

    fn bucket_idx(&self, obj_id: u64, off: usize) -> usize {
        (((obj_id as usize) << PAGE_SHIFT).wrapping_add(off)) & (self.nbuckets - 1)
    }

    /// Inserts a page into an object at a byte offset.
    pub fn add_page(&self, obj: &Arc<MemObject>, off: usize, page: &Arc<Page>) {
        {
            let state = page.state.lock();
            assert!(
                !state.flags.contains(PageFlags::IN_OBJECT),
                "page already in an object"
            );
        }
        let bucket = &self.hash[self.bucket_idx(obj.id(), off)];
        bucket.list.lock().push(page.clone());
        {
            let mut state = page.state.lock();
            state.obj = Some(PageObjRef {
                obj: Arc::downgrade(obj),
                obj_id: obj.id(),
                offset: off,
            });
            state.flags.remove(PageFlags::ALLOCED);
            state.flags.insert(PageFlags::IN_OBJECT);
        }
        obj.attach_page(page);
    }

    /// Finds the page at (object, offset), or `None`.
    pub fn lookup_page(&self, obj: &Arc<MemObject>, off: usize) -> Option<Arc<Page>> {
        let bucket = &self.hash[self.bucket_idx(obj.id(), off)];
        let list = bucket.list.lock();
        for page in list.iter() {
            let state = page.state.lock();
            if let Some(ref oref) = state.obj {
                if oref.obj_id == obj.id() && oref.offset == off {
                    drop(state);
                    return Some(page.clone());
                }
            }
        }
        None
    }

    /// Removes a page from its object and the hash.
    pub fn remove_page(&self, page: &Arc<Page>) {
        let oref = {
            let state = page.state.lock();
            assert!(
                state.flags.contains(PageFlags::IN_OBJECT),
                "page not in an object"
            );
            state.obj.clone().expect("IN_OBJECT page without object")
        };
        let bucket = &self.hash[self.bucket_idx(oref.obj_id, oref.offset)];
        bucket
            .list
            .lock()
            .retain(|p| !Arc::ptr_eq(p, page));
        if let Some(obj) = oref.obj.upgrade() {
            obj.detach_page(page);
        }
        let mut state = page.state.lock();
        state.obj = None;
        state.flags.remove(PageFlags::IN_OBJECT);
        state.flags.insert(PageFlags::ALLOCED);
    }

    /// Pins a page. The first fix sets FIXED and wires the fixed bit into
    /// every PTE via the MUL. Unusable pages silently ignore fixing.
    pub fn fix_page(&self, page: &Arc<Page>) {
        let first = {
            let mut state = page.state.lock();
            if state.flags.contains(PageFlags::UNUSABLE) {
                return;
            }
            state.fix_count += 1;
            if !state.flags.contains(PageFlags::FIXED) {
                state.flags.insert(PageFlags::FIXED);
                true
            } else {
                false
            }
        };
        if first {
            self.fixed_pages.fetch_add(1, Ordering::Relaxed);
            mul::fix_page(page);
        }
    }

    /// Unpins a page; the last unfix clears FIXED and the PTE bits.
    pub fn unfix_page(&self, page: &Arc<Page>) {
        let last = {
            let mut state = page.state.lock();
            if state.flags.contains(PageFlags::UNUSABLE) {
                return;
            }
            assert!(state.fix_count > 0, "unfix of unfixed page");
            state.fix_count -= 1;
            if state.fix_count == 0 {
                state.flags.remove(PageFlags::FIXED);
                true
            } else {
                false
            }
        };
        if last {
            self.fixed_pages.fetch_sub(1, Ordering::Relaxed);
            mul::unfix_page(page);
        }
    }

    /// Logs zone state.
    pub fn dump(&self) {
        for (i, z) in self.zones.iter().enumerate() {
            crate::debug!(
                "zone {}: base {:#x} end {:#x} free {} flags {:?}",
                i,
                z.pfn * PAGE_SIZE as u64,
                (z.pfn + z.num_pages as u64) * PAGE_SIZE as u64,
                z.free_count(),
                z.flags
            );
        }
        crate::debug!(
            "pages: {} total, {} free, {} fixed",
            self.total_pages(),
            self.free_pages(),
            self.fixed_pages()
        );
    }
}

fn is_allocatable_type(kind: MemType) -> bool {
    matches!(
        kind,
        MemType::Free | MemType::FwReclaim | MemType::BootReclaim
    )
}

static PAGE_SYS: Once<PageSys> = Once::new();

/// Builds the global page layer from the boot memory map.
pub fn init_global(mem_map: &[MemEntry]) {
    PAGE_SYS.call_once(|| PageSys::new(mem_map));
}

/// The global page layer.
///
/// # Panics
/// If the page layer has not been initialized.
pub fn page_sys() -> &'static PageSys {
    PAGE_SYS.get().expect("page layer not initialized")
}

pub fn alloc_page() -> Option<Arc<Page>> {
    page_sys().alloc_page()
}

pub fn alloc_fixed_page() -> Option<Arc<Page>> {
    page_sys().alloc_fixed_page()
}

pub fn free_page(page: &Arc<Page>) {
    page_sys().free_page(page)
}

pub fn find_page_pfn(pfn: Pfn) -> Arc<Page> {
    page_sys().find_page_pfn(pfn)
}

#[cfg(test)]
pub mod testing {
    //! Shared global page layer for hosted tests of the layers above PM.

    use super::*;

    /// Initializes the global page layer over a synthetic 32M map
    /// (idempotent across tests).
    pub fn init_test_global() {
        crate::mm::mul::testing::install_mock();
        PAGE_SYS.call_once(|| {
            PageSys::new(&[MemEntry {
                base: 0x10_0000,
                size: 0x200_0000,
                kind: MemType::Free,
                flags: 0,
            }])
        });
    }
}
