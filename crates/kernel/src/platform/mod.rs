// Platform layer: the descriptor of discovered hardware, the interrupt
// core, time events, and the PC drivers.

pub mod interrupt;
pub mod time;

#[cfg(all(target_arch = "x86_64", not(test)))]
pub mod pc;

use alloc::vec::Vec;
use spin::{Mutex, Once};

use crate::ccb::Ipl;
use interrupt::IntCtrl;

pub const NS_IN_SEC: u64 = 1_000_000_000;

/// Monotonic clock contract.
pub trait HwClock: Send + Sync {
    /// Nanoseconds since an arbitrary boot-time origin.
    fn get_time(&self) -> u64;
    /// Busy-waits for at least `ns`.
    fn poll(&self, ns: u64);
    fn precision(&self) -> u64;
}

/// One-shot timer contract driving the time-event queue.
pub trait HwTimer: Send + Sync {
    fn arm_timer(&self, delta_ns: u64);
    fn precision(&self) -> u64;
    fn max_interval(&self) -> u64;
    /// A software timer ticks with the clock; arming is a no-op and the
    /// event queue is drained on every tick.
    fn is_soft(&self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntCtrlKind {
    I8259A,
    Apic,
    Gic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusType {
    Isa,
}

/// A CPU reported by firmware tables.
#[derive(Debug, Clone, Copy)]
pub struct PltCpu {
    pub id: u32,
    pub ctrl: IntCtrlKind,
}

/// An interrupt controller reported by firmware tables.
#[derive(Debug, Clone, Copy)]
pub struct PltIntCtrl {
    pub kind: IntCtrlKind,
    pub gsi_base: u32,
    pub addr: u64,
}

/// A bus-line-to-GSI override reported by firmware tables.
#[derive(Debug, Clone, Copy)]
pub struct PltIntOverride {
    pub bus: BusType,
    pub line: u32,
    pub gsi: u32,
    pub mode: interrupt::IntMode,
    pub active_low: bool,
}

/// The platform descriptor. Firmware table parsing happens elsewhere and
/// feeds discoveries in through the add hooks.
pub struct Platform {
    cpus: Mutex<Vec<PltCpu>>,
    int_ctrls: Mutex<Vec<PltIntCtrl>>,
    overrides: Mutex<Vec<PltIntOverride>>,
    int_ctrl: Once<&'static dyn IntCtrl>,
    clock: Once<&'static dyn HwClock>,
    timer: Once<&'static dyn HwTimer>,
}

static PLATFORM: Platform = Platform {
    cpus: Mutex::new(Vec::new()),
    int_ctrls: Mutex::new(Vec::new()),
    overrides: Mutex::new(Vec::new()),
    int_ctrl: Once::new(),
    clock: Once::new(),
    timer: Once::new(),
};

pub fn platform() -> &'static Platform {
    &PLATFORM
}

impl Platform {
    pub fn add_cpu(&self, cpu: PltCpu) {
        crate::debug!("platform: found CPU {}, controller {:?}", cpu.id, cpu.ctrl);
        self.cpus.lock().push(cpu);
    }

    pub fn add_int_ctrl(&self, ctrl: PltIntCtrl) {
        crate::debug!(
            "platform: found interrupt controller {:?}, GSI base {}, address {:#x}",
            ctrl.kind,
            ctrl.gsi_base,
            ctrl.addr
        );
        self.int_ctrls.lock().push(ctrl);
    }

    pub fn add_interrupt(&self, int: PltIntOverride) {
        crate::debug!(
            "platform: found interrupt override, line {} -> GSI {}",
            int.line,
            int.gsi
        );
        self.overrides.lock().push(int);
    }

    pub fn num_cpus(&self) -> usize {
        self.cpus.lock().len()
    }

    /// Resolves a bus-relative line to a GSI. The 8259A has no overrides:
    /// lines are GSIs.
    pub fn get_gsi(&self, bus: BusType, line: u32) -> u32 {
        if let Some(ctrl) = self.int_ctrl.get() {
            if ctrl.kind() == IntCtrlKind::I8259A {
                return line;
            }
        }
        for ov in self.overrides.lock().iter() {
            if ov.bus == bus && ov.line == line {
                return ov.gsi;
            }
        }
        line
    }

    /// Installs the chosen interrupt controller and sizes the chain map.
    pub fn set_int_ctrl(&self, ctrl: &'static dyn IntCtrl) {
        self.int_ctrl.call_once(|| ctrl);
        interrupt::init_chains(ctrl.num_lines());
    }

    pub fn int_ctrl(&self) -> &'static dyn IntCtrl {
        *self.int_ctrl.get().expect("no interrupt controller")
    }

    pub fn int_ctrl_opt(&self) -> Option<&'static dyn IntCtrl> {
        self.int_ctrl.get().copied()
    }

    pub fn set_clock(&self, clock: &'static dyn HwClock) {
        self.clock.call_once(|| clock);
    }

    pub fn clock(&self) -> &'static dyn HwClock {
        *self.clock.get().expect("no clock source")
    }

    pub fn clock_opt(&self) -> Option<&'static dyn HwClock> {
        self.clock.get().copied()
    }

    pub fn set_timer(&self, timer: &'static dyn HwTimer) {
        self.timer.call_once(|| timer);
    }

    pub fn timer_opt(&self) -> Option<&'static dyn HwTimer> {
        self.timer.get().copied()
    }
}

/// Raises the IPL. Lowering through here is fatal.
pub fn raise_ipl(new: Ipl) -> Ipl {
    interrupt::raise_ipl(new)
}

/// Lowers the IPL back to a previously returned level.
pub fn lower_ipl(old: Ipl) {
    interrupt::lower_ipl(old)
}

#[cfg(test)]
pub mod testing {
    //! Mock clock and timer for hosted tests.

    use super::*;
    use core::sync::atomic::{AtomicU64, Ordering};

    pub struct MockClock {
        pub now: AtomicU64,
    }

    impl HwClock for MockClock {
        fn get_time(&self) -> u64 {
            self.now.load(Ordering::SeqCst)
        }
        fn poll(&self, ns: u64) {
            self.now.fetch_add(ns, Ordering::SeqCst);
        }
        fn precision(&self) -> u64 {
            1
        }
    }

    pub struct MockTimer {
        pub armed: AtomicU64,
        pub arms: AtomicU64,
    }

    impl HwTimer for MockTimer {
        fn arm_timer(&self, delta_ns: u64) {
            self.armed.store(delta_ns, Ordering::SeqCst);
            self.arms.fetch_add(1, Ordering::SeqCst);
        }
        fn precision(&self) -> u64 {
            1
        }
        fn max_interval(&self) -> u64 {
            u64::MAX
        }
        fn is_soft(&self) -> bool {
            false
        }
    }

    pub static MOCK_CLOCK: MockClock = MockClock {
        now: AtomicU64::new(0),
    };
    pub static MOCK_TIMER: MockTimer = MockTimer {
        armed: AtomicU64::new(0),
        arms: AtomicU64::new(0),
    };

    /// Installs the mock clock and timer (idempotent).
    pub fn install_mock_time() {
        platform().set_clock(&MOCK_CLOCK);
        platform().set_timer(&MOCK_TIMER);
    }
}
