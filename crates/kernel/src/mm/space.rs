// Address spaces: a sorted list of entries mapping virtual ranges to
// memory objects, plus the per-space MMU state.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};
use spin::{Mutex, Once};

use super::mul;
use super::object::MemObject;
use super::page::{Page, PageFlags};
use super::ptab::PtCache;
use super::{page_align_down, PhysAddr, PAGE_SIZE};
use crate::klib::error::{KResult, KernelError};

/// MUL statistics for one space.
pub struct MulStats {
    pub num_maps: AtomicI64,
    pub num_fixed: AtomicI64,
}

/// Architecture MMU state of one address space.
pub struct MulSpace {
    /// Physical address of the top-level table root.
    pub base: AtomicU64,
    pub ref_count: AtomicU32,
    /// Lazy-flush marker for spaces that are not current.
    pub tlb_update_pending: AtomicBool,
    /// Table pages owned by this space; every one is fixed.
    pub page_list: Mutex<Vec<Arc<Page>>>,
    /// Table lock: serializes walks and PTE updates in this space.
    pub lock: Mutex<()>,
    /// Page table cache and its lock. Populated by the backend.
    pub cache: Mutex<Option<PtCache>>,
}

impl MulSpace {
    fn new() -> Self {
        Self {
            base: AtomicU64::new(0),
            ref_count: AtomicU32::new(1),
            tlb_update_pending: AtomicBool::new(false),
            page_list: Mutex::new(Vec::new()),
            lock: Mutex::new(()),
            cache: Mutex::new(None),
        }
    }

    pub fn root(&self) -> PhysAddr {
        self.base.load(Ordering::Relaxed)
    }

    pub fn set_root(&self, root: PhysAddr) {
        self.base.store(root, Ordering::Relaxed);
    }
}

/// One address-space entry: `count` pages at `vaddr` backed by `obj`.
#[derive(Clone)]
pub struct SpaceEntry {
    pub vaddr: usize,
    pub count: usize,
    pub obj: Arc<MemObject>,
}

impl SpaceEntry {
    pub fn end(&self) -> usize {
        self.vaddr + self.count * PAGE_SIZE
    }

    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.vaddr && addr < self.end()
    }
}

struct EntryList {
    /// Address-sorted, non-overlapping.
    list: Vec<SpaceEntry>,
    /// Index of the last faulting entry.
    fault_hint: Option<usize>,
}

pub struct MmSpace {
    pub start: usize,
    pub end: usize,
    entries: Mutex<EntryList>,
    pub mul: MulSpace,
    pub stats: MulStats,
}

impl MmSpace {
    pub fn new(start: usize, end: usize) -> Arc<MmSpace> {
        let space = Arc::new(MmSpace {
            start,
            end,
            entries: Mutex::new(EntryList {
                list: Vec::new(),
                fault_hint: None,
            }),
            mul: MulSpace::new(),
            stats: MulStats {
                num_maps: AtomicI64::new(0),
                num_fixed: AtomicI64::new(0),
            },
        });
        space
    }

    pub fn num_entries(&self) -> usize {
        self.entries.lock().list.len()
    }

    /// Allocates an entry of `num_pages` at or after `hint_addr` (0 means
    /// anywhere in the space).
    pub fn alloc_entry(
        &self,
        obj: Arc<MemObject>,
        hint_addr: usize,
        num_pages: usize,
    ) -> KResult<usize> {
        if num_pages == 0 {
            return Err(KernelError::InvalidArgument);
        }
        let size = num_pages * PAGE_SIZE;
        let mut entries = self.entries.lock();
        let mut candidate = core::cmp::max(hint_addr, self.start);
        let mut insert_at = entries.list.len();
        for (i, ent) in entries.list.iter().enumerate() {
            if candidate + size <= ent.vaddr {
                insert_at = i;
                break;
            }
            candidate = core::cmp::max(candidate, ent.end());
        }
        if candidate + size > self.end {
            return Err(KernelError::OutOfMemory);
        }
        entries.list.insert(
            insert_at,
            SpaceEntry {
                vaddr: candidate,
                count: num_pages,
                obj,
            },
        );
        Ok(candidate)
    }

    /// Frees the entry starting at `vaddr`.
    pub fn free_entry(&self, vaddr: usize) -> KResult<()> {
        let mut entries = self.entries.lock();
        let pos = entries
            .list
            .iter()
            .position(|e| e.vaddr == vaddr)
            .ok_or(KernelError::NotFound)?;
        entries.list.remove(pos);
        entries.fault_hint = None;
        Ok(())
    }

    /// Finds the entry containing `addr`, or the immediately preceding
    /// entry if none contains it.
    pub fn find_entry(&self, addr: usize) -> Option<SpaceEntry> {
        let entries = self.entries.lock();
        let mut prev: Option<&SpaceEntry> = None;
        for ent in entries.list.iter() {
            if ent.contains(addr) {
                return Some(ent.clone());
            }
            if ent.vaddr > addr {
                break;
            }
            prev = Some(ent);
        }
        prev.cloned()
    }

    /// Finds the faulting entry, consulting and updating the fault hint.
    /// Called with the fault address unaligned.
    pub fn find_fault_entry(&self, addr: usize) -> Option<SpaceEntry> {
        let mut entries = self.entries.lock();
        if let Some(hint) = entries.fault_hint {
            if let Some(ent) = entries.list.get(hint) {
                if ent.contains(addr) {
                    return Some(ent.clone());
                }
            }
        }
        let pos = entries.list.iter().position(|e| e.contains(addr))?;
        entries.fault_hint = Some(pos);
        Some(entries.list[pos].clone())
    }

    /// Logs the entry list.
    pub fn dump(&self) {
        let entries = self.entries.lock();
        crate::debug!(
            "space {:#x}..{:#x}, {} entries",
            self.start,
            self.end,
            entries.list.len()
        );
        for ent in entries.list.iter() {
            crate::debug!(
                "  entry {:#x}..{:#x} obj {}",
                ent.vaddr,
                ent.end(),
                ent.obj.id()
            );
        }
    }
}

/// Creates an address space with live MMU state.
pub fn create_space(start: usize, end: usize) -> Arc<MmSpace> {
    let space = MmSpace::new(start, end);
    mul::create_space(&space);
    space
}

/// Drops a space reference; the MMU state is torn down at zero.
pub fn destroy_space(space: &Arc<MmSpace>) {
    mul::deref_space(space);
}

static KERNEL_SPACE: Once<Arc<MmSpace>> = Once::new();

/// Creates the kernel address space: a singleton with one entry covering
/// the whole kernel allocation range, backed by the kernel object.
pub fn create_kernel_space(obj: Arc<MemObject>, start: usize, end: usize) {
    KERNEL_SPACE.call_once(|| {
        let space = MmSpace::new(start, end);
        {
            let mut entries = space.entries.lock();
            entries.list.push(SpaceEntry {
                vaddr: start,
                count: (end - start) / PAGE_SIZE,
                obj,
            });
        }
        space
    });
}

/// The kernel address space singleton.
///
/// # Panics
/// If the kernel space has not been created.
pub fn kernel_space() -> &'static Arc<MmSpace> {
    KERNEL_SPACE.get().expect("kernel space not created")
}

pub fn kernel_space_opt() -> Option<&'static Arc<MmSpace>> {
    KERNEL_SPACE.get()
}

/// The kernel backing object.
pub fn kernel_object() -> Arc<MemObject> {
    kernel_space()
        .find_entry(kernel_space().start)
        .expect("kernel space has no entry")
        .obj
}

/// The active address space. Single-CPU, no user processes: always the
/// kernel space.
pub fn current_space() -> Arc<MmSpace> {
    kernel_space().clone()
}

/// Resolves a page for (object, offset): the resident page if there is
/// one, else a fresh page run through the backend page-in.
pub fn page_fault_in(obj: &Arc<MemObject>, offset: usize) -> KResult<Arc<Page>> {
    let sys = super::page::page_sys();
    if let Some(page) = sys.lookup_page(obj, offset) {
        if page.flags().contains(PageFlags::GUARD) {
            return Err(KernelError::InvalidArgument);
        }
        return Ok(page);
    }
    let page = sys.alloc_page().ok_or(KernelError::OutOfMemory)?;
    sys.add_page(obj, offset, &page);
    obj.page_in(offset, &page);
    Ok(page)
}

/// Page fault entry point. Returns false if the fault cannot be resolved
/// (the trap dispatcher then crashes).
pub fn page_fault(vaddr: usize, prot: mul::MulPerm) -> bool {
    let space = current_space();
    let entry = match space.find_fault_entry(vaddr) {
        Some(e) => e,
        None => return false,
    };
    let perm = entry.obj.perm();
    if !perm.contains(prot) {
        return false;
    }
    let offset = page_align_down(vaddr) - entry.vaddr;
    let page = match page_fault_in(&entry.obj, offset) {
        Ok(p) => p,
        Err(_) => return false,
    };
    mul::map_page(&space, page_align_down(vaddr), &page, perm);
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::mul::MulPerm;
    use crate::mm::object::MemBackend;

    fn test_obj(pages: usize) -> Arc<MemObject> {
        MemObject::create(pages, MemBackend::Anon, MulPerm::R | MulPerm::RW)
    }

    #[test]
    fn test_entries_sorted_non_overlapping() {
        let space = MmSpace::new(0x1000_0000, 0x2000_0000);
        let a = space.alloc_entry(test_obj(4), 0, 4).unwrap();
        let b = space.alloc_entry(test_obj(8), 0, 8).unwrap();
        let c = space.alloc_entry(test_obj(2), 0, 2).unwrap();
        assert_eq!(a, 0x1000_0000);
        assert_eq!(b, a + 4 * PAGE_SIZE);
        assert_eq!(c, b + 8 * PAGE_SIZE);
        // Free the middle entry and reallocate into the hole
        space.free_entry(b).unwrap();
        let d = space.alloc_entry(test_obj(8), 0, 8).unwrap();
        assert_eq!(d, b);
        // A larger request skips the hole
        space.free_entry(d).unwrap();
        let e = space.alloc_entry(test_obj(16), 0, 16).unwrap();
        assert_eq!(e, c + 2 * PAGE_SIZE);
    }

    #[test]
    fn test_alloc_entry_honors_hint() {
        let space = MmSpace::new(0x1000_0000, 0x2000_0000);
        let v = space
            .alloc_entry(test_obj(4), 0x1800_0000, 4)
            .unwrap();
        assert_eq!(v, 0x1800_0000);
    }

    #[test]
    fn test_alloc_entry_space_exhaustion() {
        let space = MmSpace::new(0x1000_0000, 0x1000_0000 + 8 * PAGE_SIZE);
        space.alloc_entry(test_obj(8), 0, 8).unwrap();
        assert_eq!(
            space.alloc_entry(test_obj(1), 0, 1),
            Err(KernelError::OutOfMemory)
        );
    }

    #[test]
    fn test_find_fault_entry_uses_hint() {
        let space = MmSpace::new(0x1000_0000, 0x2000_0000);
        let a = space.alloc_entry(test_obj(4), 0, 4).unwrap();
        let ent = space.find_fault_entry(a + 0x123).unwrap();
        assert_eq!(ent.vaddr, a);
        // Hit again through the hint path
        let ent = space.find_fault_entry(a + PAGE_SIZE).unwrap();
        assert_eq!(ent.vaddr, a);
        assert!(space.find_fault_entry(0x1F00_0000).is_none());
    }

    #[test]
    fn test_page_fault_in_binds_once() {
        crate::mm::page::testing::init_test_global();
        let obj = test_obj(8);
        let page = page_fault_in(&obj, 0x2000).unwrap();
        assert_eq!(obj.resident(), 1);
        let again = page_fault_in(&obj, 0x2000).unwrap();
        assert!(Arc::ptr_eq(&page, &again));
        assert_eq!(obj.resident(), 1);
        let sys = crate::mm::page::page_sys();
        sys.remove_page(&page);
        sys.free_page(&page);
    }

    #[test]
    fn test_guard_page_blocks_fault_in() {
        crate::mm::page::testing::init_test_global();
        let sys = crate::mm::page::page_sys();
        let obj = test_obj(8);
        let guard = sys.alloc_guard_page();
        sys.add_page(&obj, 0x1000, &guard);
        assert!(matches!(
            page_fault_in(&obj, 0x1000),
            Err(KernelError::InvalidArgument)
        ));
    }
}
