// Boot-info record handed over by the bootloader. The kernel consumes it;
// it never emits one.

use spin::Once;

/// Memory map entry types as reported by the bootloader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemType {
    Free,
    Reserved,
    AcpiReclaim,
    AcpiNvs,
    Mmio,
    FwReclaim,
    BootReclaim,
}

/// One entry of the physical memory map. Entries are in ascending base
/// order.
#[derive(Debug, Clone, Copy)]
pub struct MemEntry {
    pub base: u64,
    pub size: u64,
    pub kind: MemType,
    pub flags: u32,
}

/// A module loaded by the bootloader.
#[derive(Debug, Clone, Copy)]
pub struct BootModule {
    pub base: usize,
    pub size: usize,
}

/// Display descriptor, present unless the firmware default display is kept.
#[derive(Debug, Clone, Copy)]
pub struct DisplayInfo {
    pub fb_base: usize,
    pub width: u32,
    pub height: u32,
    pub bpp: u32,
    pub pitch: u32,
    pub red_mask: u32,
    pub green_mask: u32,
    pub blue_mask: u32,
}

/// The boot-info record. Slices point into bootloader-owned memory that
/// stays mapped for the kernel's lifetime.
pub struct BootInfo {
    pub mem_map: &'static [MemEntry],
    /// Early memory pool donated for the boot arena / kernel heap.
    pub mem_pool: usize,
    pub mem_pool_size: usize,
    pub args: &'static str,
    pub modules: &'static [BootModule],
    pub display: Option<DisplayInfo>,
    pub log_base: usize,
    pub sys_name: &'static str,
}

static BOOT_INFO: Once<BootInfo> = Once::new();

/// Publishes the boot-info record. Called exactly once at entry.
pub fn set_boot_info(info: BootInfo) {
    BOOT_INFO.call_once(|| info);
}

/// Returns the boot-info record.
///
/// # Panics
/// If called before `set_boot_info`.
pub fn boot_info() -> &'static BootInfo {
    BOOT_INFO.get().expect("boot info not published")
}

pub fn boot_info_opt() -> Option<&'static BootInfo> {
    BOOT_INFO.get()
}
