// 8253/8254 PIT driver. Channel 0 runs either as the system clock
// (rate generator at 100 Hz) or as a one-shot timer; when the PIT is both,
// the timer degrades to a software timer driven off the clock tick.

use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use spin::Mutex;

use crate::arch::x86_64::cpu::outb;
use crate::arch::TrapFrame;
use crate::ccb::IPL_TIMER;
use crate::platform::interrupt::{
    self, HwIntFlags, HwInterrupt, IntMode, Interrupt,
};
use crate::platform::{platform, time, BusType, HwClock, HwTimer, NS_IN_SEC};

const PIT_CHAN0: u16 = 0x40;
const PIT_MODE_CMD: u16 = 0x43;

const PIT_FREQUENCY: u64 = 1_193_180;
const PIT_HZ: u64 = 100;

// Mode/command bits
const PIT_ONESHOT: u8 = 0;
const PIT_RATEGEN: u8 = 2 << 1;
const PIT_LOHI: u8 = 3 << 4;
const PIT_SEL_CHAN0: u8 = 0;

const IRQ_PIT: u32 = 0;

pub struct PitClock {
    count: AtomicU64,
    precision: AtomicU64,
}

impl HwClock for PitClock {
    fn get_time(&self) -> u64 {
        self.count.load(Ordering::SeqCst)
    }

    fn poll(&self, ns: u64) {
        let target = self.count.load(Ordering::SeqCst) + ns;
        while self.count.load(Ordering::SeqCst) < target {
            core::hint::spin_loop();
        }
    }

    fn precision(&self) -> u64 {
        self.precision.load(Ordering::Relaxed)
    }
}

struct ArmState {
    /// Remaining full-interval arms before the final one.
    arm_count: u64,
    final_arm: u16,
}

pub struct PitTimer {
    soft: AtomicBool,
    precision: AtomicU64,
    max_interval: AtomicU64,
    arm: Mutex<ArmState>,
}

impl PitTimer {
    fn load_counter(&self, val: u16) {
        unsafe {
            outb(PIT_CHAN0, val as u8);
            outb(PIT_CHAN0, (val >> 8) as u8);
        }
    }
}

impl HwTimer for PitTimer {
    fn arm_timer(&self, delta_ns: u64) {
        let mut arm = self.arm.lock();
        arm.arm_count = 0;
        arm.final_arm = 0;
        let precision = self.precision.load(Ordering::Relaxed);
        let mut delta = delta_ns / precision;
        if delta == 0 {
            delta = 1;
        }
        let max_interval = self.max_interval.load(Ordering::Relaxed) / precision;
        if delta > max_interval {
            // Long waits split into repeated full-interval arms
            arm.arm_count = delta / max_interval;
            arm.final_arm = (delta % max_interval) as u16;
            delta = max_interval;
        }
        self.load_counter(delta as u16);
    }

    fn precision(&self) -> u64 {
        self.precision.load(Ordering::Relaxed)
    }

    fn max_interval(&self) -> u64 {
        self.max_interval.load(Ordering::Relaxed)
    }

    fn is_soft(&self) -> bool {
        self.soft.load(Ordering::Relaxed)
    }
}

static PIT_CLOCK: PitClock = PitClock {
    count: AtomicU64::new(0),
    precision: AtomicU64::new(0),
};

static PIT_TIMER: PitTimer = PitTimer {
    soft: AtomicBool::new(false),
    precision: AtomicU64::new(0),
    max_interval: AtomicU64::new(0),
    arm: Mutex::new(ArmState {
        arm_count: 0,
        final_arm: 0,
    }),
};

static PIT_IS_CLOCK: AtomicBool = AtomicBool::new(false);

/// Channel-0 interrupt: advance the clock, feed multi-part arms, and
/// drain the time event queue.
fn pit_dispatch(_obj: &Interrupt, _ctx: &mut TrapFrame) -> bool {
    if PIT_IS_CLOCK.load(Ordering::Relaxed) {
        PIT_CLOCK
            .count
            .fetch_add(PIT_CLOCK.precision.load(Ordering::Relaxed), Ordering::SeqCst);
    }
    let pending = {
        let mut arm = PIT_TIMER.arm.lock();
        if arm.arm_count > 0 {
            arm.arm_count -= 1;
            if arm.arm_count == 0 {
                let val = arm.final_arm;
                drop(arm);
                PIT_TIMER.load_counter(val);
            } else {
                let max = (PIT_TIMER.max_interval.load(Ordering::Relaxed)
                    / PIT_TIMER.precision.load(Ordering::Relaxed))
                    as u16;
                drop(arm);
                PIT_TIMER.load_counter(max);
            }
            true
        } else {
            false
        }
    };
    if !pending {
        // One shot drains the pending deadline; in periodic mode the
        // handler checks deadlines every tick
        time::time_handler();
    }
    true
}

fn install_int() {
    let gsi = platform().get_gsi(BusType::Isa, IRQ_PIT);
    let hw = HwInterrupt::new(
        pit_dispatch,
        gsi,
        IPL_TIMER,
        IntMode::Edge,
        HwIntFlags::empty(),
    );
    if interrupt::connect_interrupt(&hw).is_err() {
        panic!("unable to install PIT interrupt");
    }
}

/// Puts the PIT in rate-generator mode as the system clock.
pub fn init_clock() -> &'static PitClock {
    PIT_IS_CLOCK.store(true, Ordering::SeqCst);
    unsafe {
        outb(PIT_MODE_CMD, PIT_RATEGEN | PIT_LOHI | PIT_SEL_CHAN0);
    }
    let div = (PIT_FREQUENCY / PIT_HZ) as u16;
    PIT_CLOCK
        .precision
        .store(NS_IN_SEC / PIT_HZ, Ordering::SeqCst);
    unsafe {
        outb(PIT_CHAN0, div as u8);
        outb(PIT_CHAN0, (div >> 8) as u8);
    }
    install_int();
    crate::debug!(
        "pc: using PIT as clock, precision {}ns",
        PIT_CLOCK.precision.load(Ordering::Relaxed)
    );
    &PIT_CLOCK
}

/// Sets up the PIT timer side. With the PIT as clock the timer is a
/// software timer: events are checked on every tick.
pub fn init_timer() -> &'static PitTimer {
    if PIT_IS_CLOCK.load(Ordering::SeqCst) {
        PIT_TIMER.soft.store(true, Ordering::SeqCst);
        PIT_TIMER
            .precision
            .store(PIT_CLOCK.precision.load(Ordering::Relaxed), Ordering::SeqCst);
        crate::debug!(
            "pc: using software timer, precision {}ns",
            PIT_TIMER.precision.load(Ordering::Relaxed)
        );
    } else {
        unsafe {
            outb(PIT_MODE_CMD, PIT_ONESHOT | PIT_LOHI | PIT_SEL_CHAN0);
        }
        PIT_TIMER
            .precision
            .store(NS_IN_SEC / PIT_FREQUENCY, Ordering::SeqCst);
        PIT_TIMER.max_interval.store(
            u16::MAX as u64 * (NS_IN_SEC / PIT_FREQUENCY),
            Ordering::SeqCst,
        );
        install_int();
        crate::debug!(
            "pc: using PIT as timer, precision {}ns",
            PIT_TIMER.precision.load(Ordering::Relaxed)
        );
    }
    &PIT_TIMER
}
