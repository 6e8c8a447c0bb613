// Priority scheduler: per-priority FIFO run queues with a ready bitmap,
// FCFS within a priority, preemption control, and time slicing. Lower
// numbers are higher priority.
//
// Lock order: run queue lock, then thread lock. Everything here runs at
// IPL high; the public wrappers take the run queue lock so callers don't.
// A context switch is decided under the lock but performed after it is
// released; with interrupts off at IPL high nothing can slip between the
// two on one CPU.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::Ordering;

use super::thread::{self, Thread, ThreadFlags, ThreadState};
use super::wait::WaitObj;
use crate::arch;
use crate::ccb::{ccb, IPL_HIGH};
use crate::platform::{self, time};

pub const MAX_PRIO: usize = 64;

pub const PRIO_HIGH: u8 = 0;
pub const PRIO_KERNEL: u8 = 8;
pub const PRIO_USER: u8 = 30;
pub const PRIO_WORKER: u8 = 63;

/// Time slicer period in ns.
pub const TIMESLICE_DELTA: u64 = 10_000_000;

/// Default quantum in slicer ticks (60 ms).
pub const TIMESLICE_LEN: u32 = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    Normal,
    Fifo,
    Rr,
}

/// A pending context switch, carried out once the run queue lock drops.
struct SwitchReq {
    old_sp: *mut usize,
    new_sp: usize,
}

/// Run queue state living in the CCB behind the run queue lock.
pub struct SchedState {
    pub cur_thread: Option<Arc<Thread>>,
    pub idle_thread: Option<Arc<Thread>>,
    pub cur_priority: u8,
    pub ready_queues: Vec<alloc::collections::VecDeque<Arc<Thread>>>,
    pub ready_mask: u64,
}

impl SchedState {
    pub const fn new() -> SchedState {
        SchedState {
            cur_thread: None,
            idle_thread: None,
            cur_priority: u8::MAX,
            ready_queues: Vec::new(),
            ready_mask: 0,
        }
    }
}

fn ensure_queues(st: &mut SchedState) {
    if st.ready_queues.is_empty() {
        for _ in 0..MAX_PRIO {
            st.ready_queues.push(alloc::collections::VecDeque::new());
        }
    }
}

fn do_switch(req: Option<SwitchReq>) {
    if let Some(req) = req {
        unsafe {
            arch::switch_context(req.old_sp, req.new_sp);
        }
    }
}

/// Admits a thread to its ready queue. A preempted thread that still has
/// quantum left resumes at the head; everyone else queues FCFS.
fn ready_thread_locked(st: &mut SchedState, thread: &Arc<Thread>) -> Option<SwitchReq> {
    ensure_queues(st);
    let prio = {
        let mut ts = thread.sched.lock();
        let prio = ts.priority as usize;
        if ts.preempted {
            ts.preempted = false;
            if ts.quanta_left == 0 {
                st.ready_queues[prio].push_back(thread.clone());
            } else {
                st.ready_queues[prio].push_front(thread.clone());
            }
        } else {
            st.ready_queues[prio].push_back(thread.clone());
        }
        st.ready_mask |= 1 << prio;
        ts.quanta_left = thread.quantum();
        ts.state = ThreadState::Ready;
        ts.priority
    };
    if prio < st.cur_priority {
        return preempt_locked(st);
    }
    None
}

/// Stop hook run on the outgoing thread before a switch: account runtime,
/// re-admit a still-running thread, or publish a waiter as parked.
fn stop_thread_locked(st: &mut SchedState, thread: &Arc<Thread>) {
    let now = time::now();
    let state = {
        let mut ts = thread.sched.lock();
        ts.run_time += now.saturating_sub(ts.last_schedule);
        ts.state
    };
    match state {
        ThreadState::Running => {
            if !thread.flags().contains(ThreadFlags::IDLE) {
                // Re-admitting the current thread at its own priority
                // never outranks itself, so no switch comes back
                let req = ready_thread_locked(st, thread);
                debug_assert!(req.is_none());
            }
        }
        ThreadState::Waiting => thread.set_assert(false),
        _ => {}
    }
}

/// Pops the highest-priority ready thread.
pub(super) fn take_highest(st: &mut SchedState) -> Option<Arc<Thread>> {
    ensure_queues(st);
    let prio = arch::scan_priority(st.ready_mask)? as usize;
    let thread = st.ready_queues[prio]
        .pop_front()
        .expect("ready mask out of sync with queues");
    if st.ready_queues[prio].is_empty() {
        st.ready_mask &= !(1 << prio);
    }
    Some(thread)
}

fn set_current_locked(
    st: &mut SchedState,
    old: Option<Arc<Thread>>,
    next: Arc<Thread>,
) -> Option<SwitchReq> {
    {
        let mut ts = next.sched.lock();
        ts.state = ThreadState::Running;
        ts.last_schedule = time::now();
        st.cur_priority = ts.priority;
    }
    st.cur_thread = Some(next.clone());
    if let Some(old) = &old {
        if Arc::ptr_eq(old, &next) {
            return None;
        }
    }
    // Scratch slot for the outgoing stack pointer when there is no old
    // thread (first switch away from the boot stack)
    static BOOT_SP: core::sync::atomic::AtomicUsize = core::sync::atomic::AtomicUsize::new(0);
    let old_sp = match &old {
        Some(t) => t.sp_ptr(),
        None => BOOT_SP.as_ptr(),
    };
    Some(SwitchReq {
        old_sp,
        new_sp: next.sp(),
    })
}

/// Picks the next thread. If the current thread is still runnable and
/// nothing outranks it, this is a no-op.
fn schedule_locked(st: &mut SchedState) -> Option<SwitchReq> {
    let cur = st.cur_thread.clone();
    if let Some(cur) = &cur {
        stop_thread_locked(st, cur);
    }
    let next = match take_highest(st) {
        Some(t) => t,
        None => {
            if let Some(cur) = &cur {
                if cur.sched.lock().state == ThreadState::Running {
                    return None;
                }
            }
            st.idle_thread.clone().expect("no idle thread")
        }
    };
    set_current_locked(st, cur, next)
}

/// Marks the current thread preempted; switches now, or latches the
/// request if preemption is disabled.
fn preempt_locked(st: &mut SchedState) -> Option<SwitchReq> {
    let ccbr = ccb();
    let cur = match st.cur_thread.clone() {
        Some(t) => t,
        None => return None,
    };
    cur.sched.lock().preempted = true;
    if ccbr.preempt_disable.load(Ordering::SeqCst) > 0 {
        ccbr.preempt_req.store(true, Ordering::SeqCst);
        None
    } else {
        ccbr.preempt_req.store(false, Ordering::SeqCst);
        schedule_locked(st)
    }
}

/// The scheduler entry point. Caller is at IPL high.
pub fn schedule() {
    let req = {
        let mut st = ccb().sched.lock();
        schedule_locked(&mut st)
    };
    do_switch(req);
}

/// Readies a thread, preempting a lower-priority current thread.
pub fn ready_thread(thread: &Arc<Thread>) {
    let req = {
        let mut st = ccb().sched.lock();
        ready_thread_locked(&mut st, thread)
    };
    do_switch(req);
}

/// Readies the waiter behind a resolved wait object.
pub fn wake_obj(wobj: &Arc<WaitObj>) {
    if let Some(thread) = wobj.waiter.upgrade() {
        ready_thread(&thread);
    }
}

pub fn current_thread() -> Option<Arc<Thread>> {
    ccb().sched.lock().cur_thread.clone()
}

pub fn disable_preempt() {
    ccb().preempt_disable.fetch_add(1, Ordering::SeqCst);
}

/// Re-enables preemption; a deferred request runs now.
pub fn enable_preempt() {
    let ccbr = ccb();
    let prev = ccbr.preempt_disable.fetch_sub(1, Ordering::SeqCst);
    debug_assert!(prev > 0, "unbalanced preempt enable");
    if prev == 1 {
        let ipl = platform::raise_ipl(IPL_HIGH);
        if ccbr.preempt_req.swap(false, Ordering::SeqCst) {
            let req = {
                let mut st = ccbr.sched.lock();
                preempt_locked(&mut st)
            };
            do_switch(req);
        }
        platform::lower_ipl(ipl);
    }
}

/// Changes a thread's priority, re-queueing or preempting as its state
/// requires. The state is sampled, then re-checked under the locks.
pub fn set_thread_prio(thread: &Arc<Thread>, new_prio: u8) {
    assert!((new_prio as usize) < MAX_PRIO);
    let ccbr = ccb();
    let ipl = platform::raise_ipl(IPL_HIGH);
    loop {
        if thread.sched.lock().priority == new_prio {
            break;
        }
        let observed = thread.sched.lock().state;
        let (retry, req) = match observed {
            ThreadState::Running => {
                let mut st = ccbr.sched.lock();
                let is_cur = st
                    .cur_thread
                    .as_ref()
                    .map_or(false, |c| Arc::ptr_eq(c, thread));
                if !is_cur {
                    (true, None)
                } else {
                    let old_prio = {
                        let mut ts = thread.sched.lock();
                        let p = ts.priority;
                        ts.priority = new_prio;
                        p
                    };
                    st.cur_priority = new_prio;
                    // Dropping priority may leave a better runnable thread
                    let mut req = None;
                    if new_prio > old_prio {
                        if let Some(high) = arch::scan_priority(st.ready_mask) {
                            if (high as u8) < new_prio {
                                req = preempt_locked(&mut st);
                            }
                        }
                    }
                    (false, req)
                }
            }
            ThreadState::Ready => {
                let mut st = ccbr.sched.lock();
                ensure_queues(&mut st);
                if thread.sched.lock().state != ThreadState::Ready {
                    (true, None)
                } else {
                    let old_prio = thread.sched.lock().priority as usize;
                    st.ready_queues[old_prio].retain(|t| !Arc::ptr_eq(t, thread));
                    if st.ready_queues[old_prio].is_empty() {
                        st.ready_mask &= !(1 << old_prio);
                    }
                    thread.sched.lock().priority = new_prio;
                    st.ready_queues[new_prio as usize].push_back(thread.clone());
                    st.ready_mask |= 1 << new_prio;
                    let mut req = None;
                    if new_prio < st.cur_priority {
                        req = preempt_locked(&mut st);
                    }
                    (false, req)
                }
            }
            _ => {
                let mut ts = thread.sched.lock();
                if ts.state != observed {
                    (true, None)
                } else {
                    ts.priority = new_prio;
                    (false, None)
                }
            }
        };
        do_switch(req);
        if !retry {
            break;
        }
    }
    platform::lower_ipl(ipl);
}

/// Hands the CPU to the first thread. Never returns.
pub fn set_initial_thread(thread: &Arc<Thread>) -> ! {
    let req = {
        let mut st = ccb().sched.lock();
        {
            let mut ts = thread.sched.lock();
            ts.state = ThreadState::Running;
            ts.last_schedule = time::now();
            ts.quanta_left = thread.quantum();
            st.cur_priority = ts.priority;
        }
        st.cur_thread = Some(thread.clone());
        static BOOT_SP: core::sync::atomic::AtomicUsize = core::sync::atomic::AtomicUsize::new(0);
        SwitchReq {
            old_sp: BOOT_SP.as_ptr(),
            new_sp: thread.sp(),
        }
    };
    unsafe {
        arch::switch_context(req.old_sp, req.new_sp);
    }
    unreachable!("initial thread returned");
}

fn idle_entry(_arg: usize) {
    loop {
        arch::halt();
    }
}

/// Time slice tick: burn the current thread's quantum and request
/// preemption at expiry. FIFO threads are exempt.
fn time_slice(_evt: &Arc<time::TimeEvent>, _arg: usize) {
    let ipl = platform::raise_ipl(IPL_HIGH);
    let ccbr = ccb();
    let cur = ccbr.sched.lock().cur_thread.clone();
    if let Some(cur) = cur {
        let expired = {
            let mut ts = cur.sched.lock();
            if cur.flags().contains(ThreadFlags::FIFO) {
                false
            } else if ts.quanta_left == 0 {
                true
            } else {
                ts.quanta_left -= 1;
                false
            }
        };
        if expired {
            let req = {
                let mut st = ccbr.sched.lock();
                preempt_locked(&mut st)
            };
            do_switch(req);
        }
    }
    platform::lower_ipl(ipl);
}

/// Initializes the scheduler: run queues, the idle thread, and the time
/// slicer.
pub fn init_sched() {
    let ccbr = ccb();
    {
        let mut st = ccbr.sched.lock();
        ensure_queues(&mut st);
        let idle = thread::create_thread(
            idle_entry,
            0,
            "idle",
            Policy::Fifo,
            PRIO_WORKER,
            ThreadFlags::IDLE,
        )
        .expect("can't create idle thread");
        st.idle_thread = Some(idle);
    }
    ccbr.preempt_disable.store(0, Ordering::SeqCst);
    let evt = time::new_event();
    time::set_cb_event(&evt, time_slice, 0);
    time::reg_event(&evt, TIMESLICE_DELTA, true);
}


#[cfg(test)]
mod tests {
    use super::testing::reset;
    use super::*;
    use crate::task::thread::testing::bare_thread;

    #[test]
    fn test_ready_sets_mask_and_fcfs_order() {
        let _guard = crate::ccb::testing::lock();
        reset();
        let a = bare_thread("a", 10);
        let b = bare_thread("b", 10);
        let c = bare_thread("c", 5);
        ready_thread(&a);
        ready_thread(&b);
        ready_thread(&c);
        let mut st = ccb().sched.lock();
        assert_eq!(st.ready_mask, (1 << 10) | (1 << 5));
        // Highest priority first, FCFS within a priority
        let first = take_highest(&mut st).unwrap();
        assert!(Arc::ptr_eq(&first, &c));
        let second = take_highest(&mut st).unwrap();
        assert!(Arc::ptr_eq(&second, &a));
        let third = take_highest(&mut st).unwrap();
        assert!(Arc::ptr_eq(&third, &b));
        assert_eq!(st.ready_mask, 0);
        assert_eq!(a.state(), ThreadState::Ready);
        drop(st);
        reset();
    }

    #[test]
    fn test_preempted_thread_resumes_at_head() {
        let _guard = crate::ccb::testing::lock();
        reset();
        let a = bare_thread("a", 12);
        let b = bare_thread("b", 12);
        ready_thread(&a);
        // b was preempted mid-quantum: it goes to the head
        {
            let mut ts = b.sched.lock();
            ts.preempted = true;
            ts.quanta_left = 3;
        }
        ready_thread(&b);
        let mut st = ccb().sched.lock();
        let first = take_highest(&mut st).unwrap();
        assert!(Arc::ptr_eq(&first, &b));
        assert!(!b.sched.lock().preempted);
        drop(st);
        reset();
    }

    #[test]
    fn test_preempted_thread_with_spent_quantum_queues_fcfs() {
        let _guard = crate::ccb::testing::lock();
        reset();
        let a = bare_thread("a", 12);
        let b = bare_thread("b", 12);
        ready_thread(&a);
        {
            let mut ts = b.sched.lock();
            ts.preempted = true;
            ts.quanta_left = 0;
        }
        ready_thread(&b);
        let mut st = ccb().sched.lock();
        let first = take_highest(&mut st).unwrap();
        assert!(Arc::ptr_eq(&first, &a));
        drop(st);
        reset();
    }

    #[test]
    fn test_higher_priority_ready_requests_preemption() {
        // S5: current runs at 30; readying a 10 with preemption disabled
        // latches the request
        let _guard = crate::ccb::testing::lock();
        reset();
        let cur = bare_thread("cur", 30);
        {
            let mut ts = cur.sched.lock();
            ts.state = ThreadState::Running;
        }
        {
            let mut st = ccb().sched.lock();
            st.cur_thread = Some(cur.clone());
            st.cur_priority = 30;
        }
        disable_preempt();
        let hi = bare_thread("hi", 10);
        ready_thread(&hi);
        assert!(ccb().preempt_req.load(Ordering::SeqCst));
        assert!(cur.sched.lock().preempted);
        // An equal or lower priority thread does not preempt
        ccb().preempt_req.store(false, Ordering::SeqCst);
        cur.sched.lock().preempted = false;
        let lo = bare_thread("lo", 40);
        ready_thread(&lo);
        assert!(!ccb().preempt_req.load(Ordering::SeqCst));
        ccb().preempt_disable.store(0, Ordering::SeqCst);
        reset();
    }

    #[test]
    fn test_set_prio_relocates_ready_thread() {
        let _guard = crate::ccb::testing::lock();
        reset();
        let t = bare_thread("mv", 20);
        ready_thread(&t);
        set_thread_prio(&t, 7);
        let mut st = ccb().sched.lock();
        assert_eq!(st.ready_mask, 1 << 7);
        let got = take_highest(&mut st).unwrap();
        assert!(Arc::ptr_eq(&got, &t));
        assert_eq!(t.priority(), 7);
        drop(st);
        reset();
    }

    #[test]
    fn test_set_prio_on_blocked_thread_just_updates() {
        let _guard = crate::ccb::testing::lock();
        reset();
        let t = bare_thread("blocked", 20);
        set_thread_prio(&t, 33);
        assert_eq!(t.priority(), 33);
        assert_eq!(t.state(), ThreadState::Created);
        reset();
    }

    #[test]
    fn test_time_slice_burns_quantum_and_requests_preempt() {
        let _guard = crate::ccb::testing::lock();
        reset();
        crate::platform::testing::install_mock_time();
        let cur = bare_thread("cur", 30);
        {
            let mut ts = cur.sched.lock();
            ts.state = ThreadState::Running;
            ts.quanta_left = 1;
        }
        {
            let mut st = ccb().sched.lock();
            st.cur_thread = Some(cur.clone());
            st.cur_priority = 30;
        }
        disable_preempt();
        let evt = time::new_event();
        time_slice(&evt, 0);
        assert_eq!(cur.sched.lock().quanta_left, 0);
        assert!(!ccb().preempt_req.load(Ordering::SeqCst));
        time_slice(&evt, 0);
        assert!(ccb().preempt_req.load(Ordering::SeqCst));
        ccb().preempt_disable.store(0, Ordering::SeqCst);
        ccb().preempt_req.store(false, Ordering::SeqCst);
        reset();
    }

    #[test]
    fn test_fifo_thread_immune_to_slicing() {
        let _guard = crate::ccb::testing::lock();
        reset();
        crate::platform::testing::install_mock_time();
        let cur = crate::task::thread::create_thread(
            |_| {},
            0,
            "fifo",
            Policy::Fifo,
            8,
            ThreadFlags::empty(),
        )
        .unwrap();
        {
            let mut ts = cur.sched.lock();
            ts.state = ThreadState::Running;
            ts.quanta_left = 0;
        }
        {
            let mut st = ccb().sched.lock();
            st.cur_thread = Some(cur.clone());
            st.cur_priority = 8;
        }
        disable_preempt();
        let evt = time::new_event();
        time_slice(&evt, 0);
        assert!(!ccb().preempt_req.load(Ordering::SeqCst));
        ccb().preempt_disable.store(0, Ordering::SeqCst);
        reset();
    }
}
