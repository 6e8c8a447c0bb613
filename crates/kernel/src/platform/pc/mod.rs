// PC platform: 8259A interrupt controller and PIT clock/timer. The
// controller choice is made here; APIC systems slot in through the same
// IntCtrl contract.

pub mod pic;
pub mod pit;

use super::platform;

/// Brings up the PC interrupt controller.
pub fn init_interrupts() {
    let ctrl = pic::init();
    platform().set_int_ctrl(ctrl);
}

/// Brings up the PC clock and timer.
pub fn init_time() {
    let clock = pit::init_clock();
    platform().set_clock(clock);
    let timer = pit::init_timer();
    platform().set_timer(timer);
}
