// x86_64 CPU primitives: interrupt gating, control registers, MSRs,
// feature detection.

use core::sync::atomic::{AtomicBool, Ordering};
use x86_64::instructions::interrupts;
use x86_64::registers::control::Cr3;

// Interrupts stay held from entry until the initial thread releases them;
// enable() is a no-op until then so early code can pair disable()/enable()
// freely.
static INTS_HELD: AtomicBool = AtomicBool::new(true);

pub fn disable() {
    interrupts::disable();
}

pub fn enable() {
    if !INTS_HELD.load(Ordering::SeqCst) {
        interrupts::enable();
    }
}

pub fn hold_ints() {
    INTS_HELD.store(true, Ordering::SeqCst);
    interrupts::disable();
}

pub fn unhold_ints() {
    INTS_HELD.store(false, Ordering::SeqCst);
    interrupts::enable();
}

pub fn halt() {
    x86_64::instructions::hlt();
}

pub fn crash() -> ! {
    interrupts::disable();
    loop {
        x86_64::instructions::hlt();
    }
}

/// Physical address of the top-level page table.
pub fn read_cr3() -> u64 {
    Cr3::read().0.start_address().as_u64()
}

/// Reloads CR3, flushing the non-global TLB.
///
/// # Safety
/// `val` must be the physical address of a valid top-level table.
pub unsafe fn write_cr3(val: u64) {
    use x86_64::registers::control::Cr3Flags;
    use x86_64::structures::paging::PhysFrame;
    use x86_64::PhysAddr;
    Cr3::write(
        PhysFrame::containing_address(PhysAddr::new(val)),
        Cr3Flags::empty(),
    );
}

/// Invalidates the TLB entry for one virtual address.
pub fn invlpg(addr: usize) {
    x86_64::instructions::tlb::flush(x86_64::VirtAddr::new(addr as u64));
}

/// # Safety
/// Caller must know the MSR and value are valid for this CPU.
pub unsafe fn wrmsr(msr: u32, val: u64) {
    let mut reg = x86_64::registers::model_specific::Msr::new(msr);
    reg.write(val);
}

/// Port output, byte wide.
///
/// # Safety
/// Port I/O has device-defined side effects.
pub unsafe fn outb(port: u16, val: u8) {
    let mut p = x86_64::instructions::port::Port::<u8>::new(port);
    p.write(val);
}

/// Port input, byte wide.
///
/// # Safety
/// Port I/O has device-defined side effects.
pub unsafe fn inb(port: u16) -> u8 {
    let mut p = x86_64::instructions::port::Port::<u8>::new(port);
    p.read()
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CpuFeatures: u32 {
        const PAT = 1 << 0;
        const PGE = 1 << 1;
        const NX  = 1 << 2;
    }
}

/// Detects the features the MUL cares about.
pub fn features() -> CpuFeatures {
    let cpuid = raw_cpuid::CpuId::new();
    let mut feat = CpuFeatures::empty();
    if let Some(f) = cpuid.get_feature_info() {
        if f.has_pat() {
            feat |= CpuFeatures::PAT;
        }
        if f.has_pge() {
            feat |= CpuFeatures::PGE;
        }
    }
    if let Some(f) = cpuid.get_extended_processor_and_feature_identifiers() {
        if f.has_execute_disable() {
            feat |= CpuFeatures::NX;
        }
    }
    feat
}
