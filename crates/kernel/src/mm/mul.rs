// MMU abstraction layer (MUL) facade. The architecture backend is a trait
// selected once during bring-up; everything above this module is machine
// independent.

use alloc::sync::Arc;
use spin::Once;

use super::page::Page;
use super::space::MmSpace;
use super::PhysAddr;

bitflags::bitflags! {
    /// Machine-independent mapping permissions and attributes.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MulPerm: u32 {
        /// Readable
        const R   = 1 << 0;
        /// Writable
        const RW  = 1 << 1;
        /// Kernel only
        const KE  = 1 << 2;
        /// Executable
        const X   = 1 << 3;
        /// Cache disabled
        const CD  = 1 << 4;
        /// Write through
        const WT  = 1 << 5;
        /// Present
        const P   = 1 << 6;
        /// Write combining
        const WC  = 1 << 7;
        /// Device memory
        const DEV = 1 << 8;
    }
}

/// Wired page attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MulAttr {
    Access,
    Dirty,
}

/// The per-architecture MUL contract. One implementation is installed at
/// boot; unit tests install a mock.
pub trait MulBackend: Send + Sync {
    /// Switches from the early-boot mapping path to the runtime walker.
    fn init(&self);

    /// Maps a page before the page table cache exists. Only valid while
    /// the bootloader's tables are live.
    fn map_early(&self, virt: usize, phys: PhysAddr, perm: MulPerm);

    /// Translates a virtual address through the live tables during early
    /// boot.
    fn get_phys_early(&self, virt: usize) -> PhysAddr;

    fn create_space(&self, space: &MmSpace);
    fn ref_space(&self, space: &MmSpace);
    /// Drops a space reference; tears the page tables down at zero.
    /// Destroying the kernel space is fatal.
    fn deref_space(&self, space: &MmSpace);

    fn map_page(&self, space: &Arc<MmSpace>, virt: usize, page: &Arc<Page>, perm: MulPerm);
    fn unmap_range(&self, space: &Arc<MmSpace>, base: usize, count: usize);
    fn protect_range(&self, space: &Arc<MmSpace>, base: usize, count: usize, perm: MulPerm);

    /// Unmaps every alias of a page via its back-mapping list.
    fn unmap_page(&self, page: &Arc<Page>);
    fn protect_page(&self, page: &Arc<Page>, perm: MulPerm);

    /// Sets the fixed bit on every PTE pointing at the page.
    fn fix_page(&self, page: &Arc<Page>);
    fn unfix_page(&self, page: &Arc<Page>);

    fn get_mapping(&self, space: &Arc<MmSpace>, virt: usize) -> Option<Arc<Page>>;

    /// Zeroes a physical page through a scratch window.
    fn zero_page(&self, page: &Page);

    fn get_attr(&self, space: &Arc<MmSpace>, virt: usize, attr: MulAttr) -> bool;
    fn set_attr(&self, space: &Arc<MmSpace>, virt: usize, attr: MulAttr, val: bool);
}

static MUL: Once<&'static dyn MulBackend> = Once::new();

/// Installs the MUL backend. Later installs are ignored.
pub fn install(backend: &'static dyn MulBackend) {
    MUL.call_once(|| backend);
}

fn backend() -> &'static dyn MulBackend {
    *MUL.get().expect("MUL backend not installed")
}

/// Selects the architecture backend. Early-boot callers (the page layer's
/// PFN map publication) only need `map_early`, which is valid before
/// `init` runs.
pub fn install_arch() {
    #[cfg(all(target_arch = "x86_64", not(test)))]
    install(&crate::arch::x86_64::mul::X64_MUL);
}

/// Cuts over from the early-boot mapping path to the runtime walker.
pub fn init() {
    backend().init();
}

pub fn map_early(virt: usize, phys: PhysAddr, perm: MulPerm) {
    backend().map_early(virt, phys, perm)
}

pub fn get_phys_early(virt: usize) -> PhysAddr {
    backend().get_phys_early(virt)
}

pub fn create_space(space: &MmSpace) {
    backend().create_space(space)
}

pub fn ref_space(space: &MmSpace) {
    backend().ref_space(space)
}

pub fn deref_space(space: &MmSpace) {
    backend().deref_space(space)
}

pub fn map_page(space: &Arc<MmSpace>, virt: usize, page: &Arc<Page>, perm: MulPerm) {
    backend().map_page(space, virt, page, perm)
}

pub fn unmap_range(space: &Arc<MmSpace>, base: usize, count: usize) {
    backend().unmap_range(space, base, count)
}

pub fn protect_range(space: &Arc<MmSpace>, base: usize, count: usize, perm: MulPerm) {
    backend().protect_range(space, base, count, perm)
}

pub fn unmap_page(page: &Arc<Page>) {
    backend().unmap_page(page)
}

pub fn protect_page(page: &Arc<Page>, perm: MulPerm) {
    backend().protect_page(page, perm)
}

pub fn fix_page(page: &Arc<Page>) {
    backend().fix_page(page)
}

pub fn unfix_page(page: &Arc<Page>) {
    backend().unfix_page(page)
}

pub fn get_mapping(space: &Arc<MmSpace>, virt: usize) -> Option<Arc<Page>> {
    backend().get_mapping(space, virt)
}

pub fn zero_page(page: &Page) {
    backend().zero_page(page)
}

pub fn get_attr(space: &Arc<MmSpace>, virt: usize, attr: MulAttr) -> bool {
    backend().get_attr(space, virt, attr)
}

pub fn set_attr(space: &Arc<MmSpace>, virt: usize, attr: MulAttr, val: bool) {
    backend().set_attr(space, virt, attr, val)
}

#[cfg(test)]
pub mod testing {
    //! A recording MUL backend for hosted tests.

    use super::*;
    use core::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    pub struct MockMul {
        pub maps: AtomicUsize,
        pub unmaps: AtomicUsize,
        pub fixes: AtomicUsize,
        pub unfixes: AtomicUsize,
        pub zeroed: AtomicUsize,
        pub early_maps: AtomicUsize,
    }

    impl MulBackend for MockMul {
        fn init(&self) {}
        fn map_early(&self, _virt: usize, _phys: PhysAddr, _perm: MulPerm) {
            self.early_maps.fetch_add(1, Ordering::Relaxed);
        }
        fn get_phys_early(&self, virt: usize) -> PhysAddr {
            virt as PhysAddr
        }
        fn create_space(&self, _space: &MmSpace) {}
        fn ref_space(&self, space: &MmSpace) {
            space.mul.ref_count.fetch_add(1, Ordering::SeqCst);
        }
        fn deref_space(&self, space: &MmSpace) {
            space.mul.ref_count.fetch_sub(1, Ordering::SeqCst);
        }
        fn map_page(&self, space: &Arc<MmSpace>, virt: usize, page: &Arc<Page>, _perm: MulPerm) {
            self.maps.fetch_add(1, Ordering::Relaxed);
            space.stats.num_maps.fetch_add(1, Ordering::Relaxed);
            page.add_mapping(space, virt);
        }
        fn unmap_range(&self, space: &Arc<MmSpace>, _base: usize, count: usize) {
            self.unmaps.fetch_add(count, Ordering::Relaxed);
            space
                .stats
                .num_maps
                .fetch_sub(count as i64, Ordering::Relaxed);
        }
        fn protect_range(&self, _space: &Arc<MmSpace>, _base: usize, _count: usize, _perm: MulPerm) {
        }
        fn unmap_page(&self, page: &Arc<Page>) {
            self.unmaps.fetch_add(1, Ordering::Relaxed);
            page.clear_mappings();
        }
        fn protect_page(&self, _page: &Arc<Page>, _perm: MulPerm) {}
        fn fix_page(&self, _page: &Arc<Page>) {
            self.fixes.fetch_add(1, Ordering::Relaxed);
        }
        fn unfix_page(&self, _page: &Arc<Page>) {
            self.unfixes.fetch_add(1, Ordering::Relaxed);
        }
        fn get_mapping(&self, _space: &Arc<MmSpace>, _virt: usize) -> Option<Arc<Page>> {
            None
        }
        fn zero_page(&self, _page: &Page) {
            self.zeroed.fetch_add(1, Ordering::Relaxed);
        }
        fn get_attr(&self, _space: &Arc<MmSpace>, _virt: usize, _attr: MulAttr) -> bool {
            false
        }
        fn set_attr(&self, _space: &Arc<MmSpace>, _virt: usize, _attr: MulAttr, _val: bool) {}
    }

    static MOCK: MockMul = MockMul {
        maps: AtomicUsize::new(0),
        unmaps: AtomicUsize::new(0),
        fixes: AtomicUsize::new(0),
        unfixes: AtomicUsize::new(0),
        zeroed: AtomicUsize::new(0),
        early_maps: AtomicUsize::new(0),
    };

    /// Installs the shared mock backend (idempotent across tests).
    pub fn install_mock() -> &'static MockMul {
        super::install(&MOCK);
        &MOCK
    }
}
