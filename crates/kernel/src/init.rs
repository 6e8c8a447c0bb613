// Kernel bring-up. The bootloader hands over a boot-info record; by the
// time the initial thread runs, every subsystem is live.

use crate::klib::bootinfo::{self, BootInfo};
use crate::klib::printk::LogLevel;
use crate::task::sched::{self, Policy};
use crate::task::thread::{self, ThreadFlags};
use crate::{arch, klib, mm, platform, task};

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Kernel entry, called by the architecture boot shim with interrupts
/// held.
pub fn kernel_main(boot: BootInfo) -> ! {
    bootinfo::set_boot_info(boot);
    // Phase 1 MM first: everything after this may allocate
    mm::init_phase1();
    #[cfg(all(target_arch = "x86_64", not(test)))]
    arch::x86_64::serial::init();
    if let Some(level) = klib::args::read_arg("loglevel") {
        if let Ok(n) = level.parse::<u8>() {
            let level = match n {
                0..=3 => LogLevel::Error,
                4 => LogLevel::Warn,
                5 => LogLevel::Notice,
                6 => LogLevel::Info,
                _ => LogLevel::Debug,
            };
            klib::printk::set_log_level(level);
        }
    }
    crate::info!("nexke version {}", VERSION);
    crate::info!("booting on {}", bootinfo::boot_info().sys_name);
    // Trap plumbing before anything can fault
    #[cfg(all(target_arch = "x86_64", not(test)))]
    arch::x86_64::idt::init();
    // Page layer and MUL cutover, then the kernel space and main arena
    mm::init_phase2();
    mm::init_kvm2();
    // Platform interrupts, clock, and timer
    #[cfg(all(target_arch = "x86_64", not(test)))]
    {
        platform::pc::init_interrupts();
        register_exceptions();
        platform::pc::init_time();
    }
    // Multitasking
    task::init();
    let init_thread = thread::create_thread(
        initial_thread,
        0,
        "init",
        Policy::Normal,
        sched::PRIO_HIGH,
        ThreadFlags::empty(),
    )
    .expect("can't create initial thread");
    sched::set_initial_thread(&init_thread);
}

/// First thread. Interrupts open up here; later bring-up (drivers,
/// services) hangs off this.
fn initial_thread(_arg: usize) {
    arch::unhold_ints();
    crate::info!("boot complete");
    loop {
        thread::yield_now();
        arch::halt();
    }
}

/// Page fault first-level handler: give the fault-in path a shot before
/// declaring a bad trap.
#[cfg(all(target_arch = "x86_64", not(test)))]
fn page_fault_handler(
    _obj: &platform::interrupt::Interrupt,
    ctx: &mut arch::TrapFrame,
) -> bool {
    use mm::mul::MulPerm;
    let addr = x86_64::registers::control::Cr2::read().as_u64() as usize;
    let mut prot = MulPerm::R;
    // Bit 1 of the error code: write access
    if ctx.err_code & (1 << 1) != 0 {
        prot |= MulPerm::RW;
    }
    mm::space::page_fault(addr, prot)
}

#[cfg(all(target_arch = "x86_64", not(test)))]
fn register_exceptions() {
    use platform::interrupt::{install_exec, Interrupt};

    fn unhandled(_obj: &Interrupt, _ctx: &mut arch::TrapFrame) -> bool {
        false
    }
    for vector in 0..32u32 {
        let handler: platform::interrupt::IntHandler = if vector == 14 {
            page_fault_handler
        } else {
            unhandled
        };
        // Vectors the CPU never delivers still get an entry so a stray
        // trap crashes with a name instead of "unhandled interrupt"
        let _ = install_exec(vector, handler);
    }
}
