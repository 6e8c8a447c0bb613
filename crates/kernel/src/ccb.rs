// Per-CPU control block. Single CPU for now; every shared structure still
// carries its own lock so SMP is an addition, not a rework.

use core::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use spin::Mutex;

use crate::platform::time::TimeEventList;
use crate::task::sched::SchedState;

/// Interrupt priority level. Interrupts at or below the current level are
/// masked. 0 is IPL low; the top levels are reserved for the clock and
/// the "everything masked" state.
pub type Ipl = u8;

pub const IPL_LOW: Ipl = 0;
pub const IPL_TIMER: Ipl = 29;
pub const IPL_CLOCK: Ipl = 30;
pub const IPL_HIGH: Ipl = 31;

pub const NUM_IPLS: usize = 32;

pub struct Ccb {
    pub cur_ipl: AtomicU8,
    pub int_count: AtomicU64,
    pub spurious_ints: AtomicU64,
    /// Set only while a hardware interrupt is being processed.
    pub int_active: AtomicBool,
    pub preempt_disable: AtomicU64,
    pub preempt_req: AtomicBool,
    /// Run queues, current thread, ready bitmap. This mutex is the run
    /// queue lock; hold it only at IPL high.
    pub sched: Mutex<SchedState>,
    /// Deadline-ordered time events.
    pub time_events: Mutex<TimeEventList>,
}

static CCB: Ccb = Ccb {
    cur_ipl: AtomicU8::new(IPL_HIGH),
    int_count: AtomicU64::new(0),
    spurious_ints: AtomicU64::new(0),
    int_active: AtomicBool::new(false),
    preempt_disable: AtomicU64::new(0),
    preempt_req: AtomicBool::new(false),
    sched: Mutex::new(SchedState::new()),
    time_events: Mutex::new(TimeEventList::new()),
};

pub fn ccb() -> &'static Ccb {
    &CCB
}

impl Ccb {
    pub fn cur_ipl(&self) -> Ipl {
        self.cur_ipl.load(Ordering::SeqCst)
    }

    pub fn int_active(&self) -> bool {
        self.int_active.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
pub mod testing {
    //! Serialization for tests that touch the global CCB.

    use std::sync::{Mutex, MutexGuard};

    static TEST_LOCK: Mutex<()> = Mutex::new(());

    /// Serializes CCB-touching tests; panicking holders are tolerated.
    pub fn lock() -> MutexGuard<'static, ()> {
        TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner())
    }
}
