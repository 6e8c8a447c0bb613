// Memory management subsystem:
// - page:   physical page frame manager (zones, PFN maps, page hash)
// - object: pageable memory objects with backend dispatch
// - kvm:    kernel virtual memory arenas
// - space:  address spaces and entries
// - ptab:   machine-independent page table walker and cache
// - mul:    MMU abstraction layer facade

pub mod kvm;
pub mod mul;
pub mod object;
pub mod page;
pub mod ptab;
pub mod space;

pub type PhysAddr = u64;
pub type Pfn = u64;

pub const PAGE_SIZE: usize = 4096;
pub const PAGE_SHIFT: usize = 12;

/// Kernel half base.
pub const KERNEL_BASE: usize = 0xFFFF_FFFF_8000_0000;

/// Kernel general allocation range served by the main KVM arena.
pub const KERNEL_ADDR_START: usize = 0xFFFF_FFFF_C000_0000;
pub const KERNEL_ADDR_END: usize = 0xFFFF_FFFF_DFFF_FFFF;

/// Size cap of the PFN map window.
pub const PFNMAP_MAX: usize = 0xE_8000_0000 - 0x10;

/// Fixed virtual window the PFN map is published at during early boot.
pub const PFNMAP_BASE: usize = 0xFFFF_FFF0_0000_0000;

#[inline]
pub const fn page_align_up(addr: usize) -> usize {
    (addr + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

#[inline]
pub const fn page_align_down(addr: usize) -> usize {
    addr & !(PAGE_SIZE - 1)
}

/// Phase 1 MM bring-up: carve the bootloader pool into the kernel heap and
/// the boot KVM arena. Runs before the page layer exists.
pub fn init_phase1() {
    let boot = crate::klib::bootinfo::boot_info();
    let pool = boot.mem_pool;
    let pool_size = boot.mem_pool_size;
    // Half the pool backs the heap, the other half the pre-mapped boot
    // arena that early page-table and stack allocations draw from.
    let heap_size = page_align_down(pool_size / 2);
    crate::heap_init(pool, heap_size);
    let arena = alloc::sync::Arc::new(kvm::KvArena::new(
        pool + heap_size,
        pool + page_align_down(pool_size),
        false,
    ));
    kvm::add_arena(arena);
    crate::debug!(
        "mm: boot pool at {:#x}, {} KiB heap, {} KiB boot arena",
        pool,
        heap_size / 1024,
        (page_align_down(pool_size) - heap_size) / 1024
    );
}

/// Phase 2 MM bring-up: the page frame layer over the early-boot mapping
/// path, then the MUL cutover to the runtime walker.
pub fn init_phase2() {
    mul::install_arch();
    page::init_global(crate::klib::bootinfo::boot_info().mem_map);
    mul::init();
}

/// Second phase KVM init: kernel object, kernel space, and the main
/// demand-paged arena.
pub fn init_kvm2() {
    let num_pages = ((KERNEL_ADDR_END + 1) - KERNEL_ADDR_START) / PAGE_SIZE;
    let obj = object::MemObject::create(
        num_pages,
        object::MemBackend::Kernel,
        mul::MulPerm::R | mul::MulPerm::RW | mul::MulPerm::KE,
    );
    crate::debug!(
        "mm: kernel page object has size {} KiB",
        (num_pages * PAGE_SIZE) / 1024
    );
    space::create_kernel_space(obj, KERNEL_ADDR_START, KERNEL_ADDR_END + 1);
    let arena = alloc::sync::Arc::new(kvm::KvArena::new(
        KERNEL_ADDR_START,
        KERNEL_ADDR_END + 1,
        true,
    ));
    kvm::add_arena(arena);
}
