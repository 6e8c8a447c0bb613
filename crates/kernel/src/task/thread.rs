// Thread manager: creation, the TID table, waits, joins, termination
// through the terminator work queue.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, Ordering};
use spin::{Mutex, Once};

use super::sched::{self, Policy};
use super::wait::{self, WaitObj, WaitQueue, WaitType};
use super::work::{self, WorkQueue};
use crate::arch::{self, ThreadContext};
use crate::ccb::{IPL_HIGH, IPL_LOW};
use crate::klib::error::KResult;
use crate::klib::resource::ResArena;
use crate::platform::{self, time};

pub type ThreadEntry = fn(usize);

pub const MAX_THREADS: u32 = 8192;

/// Work items queued before the terminator drains them.
const TERMINATOR_THRESHOLD: usize = 5;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ThreadFlags: u32 {
        const IDLE       = 1 << 0;
        const FIXED_PRIO = 1 << 1;
        const FIFO       = 1 << 2;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    Created,
    Ready,
    Running,
    Waiting,
    Terminating,
}

/// Scheduler-visible thread state, guarded by the thread lock.
pub struct ThreadSched {
    pub state: ThreadState,
    pub priority: u8,
    pub quanta_left: u32,
    pub preempted: bool,
    pub timeout_pending: bool,
    pub ref_count: u32,
    pub exit_code: i32,
    pub last_schedule: u64,
    pub run_time: u64,
    pub wait: Option<Arc<WaitObj>>,
    /// Wait objects this thread owns; only the owner touches this.
    pub owned_waits: Vec<Arc<WaitObj>>,
}

/// Saved stack pointer slot written by the context switch.
struct SpCell(UnsafeCell<usize>);

// The slot is only touched under the run queue lock at IPL high.
unsafe impl Sync for SpCell {}
unsafe impl Send for SpCell {}

pub struct Thread {
    tid: u32,
    name: &'static str,
    entry: ThreadEntry,
    arg: usize,
    policy: Policy,
    flags: ThreadFlags,
    quantum: u32,
    pub sched: Mutex<ThreadSched>,
    /// The parked-wait gate; see `assert_wait` / the stop hook.
    wait_asserted: AtomicBool,
    pub join_queue: WaitQueue,
    timeout: Arc<time::TimeEvent>,
    sp: SpCell,
    /// Owns the kernel stack.
    _ctx: Mutex<Option<ThreadContext>>,
}

impl Thread {
    pub fn tid(&self) -> u32 {
        self.tid
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn flags(&self) -> ThreadFlags {
        self.flags
    }

    pub fn policy(&self) -> Policy {
        self.policy
    }

    pub fn quantum(&self) -> u32 {
        self.quantum
    }

    pub fn arg(&self) -> usize {
        self.arg
    }

    pub fn entry_fn(&self) -> ThreadEntry {
        self.entry
    }

    pub fn timeout_event(&self) -> &Arc<time::TimeEvent> {
        &self.timeout
    }

    pub fn priority(&self) -> u8 {
        self.sched.lock().priority
    }

    pub fn state(&self) -> ThreadState {
        self.sched.lock().state
    }

    pub(super) fn sp_ptr(&self) -> *mut usize {
        self.sp.0.get()
    }

    pub(super) fn sp(&self) -> usize {
        unsafe { *self.sp.0.get() }
    }

    pub fn set_assert(&self, val: bool) {
        self.wait_asserted.store(val, Ordering::Release);
    }

    pub fn wait_asserted(&self) -> bool {
        self.wait_asserted.load(Ordering::Acquire)
    }

    /// Spins until the thread has safely parked (assert flag dropped by
    /// the scheduler's stop hook).
    pub fn check_assert(&self) {
        while self.wait_asserted.load(Ordering::Acquire) {
            core::hint::spin_loop();
        }
    }
}

static THREAD_RES: Once<ResArena> = Once::new();
static THREAD_TABLE: Mutex<BTreeMap<u32, Arc<Thread>>> = Mutex::new(BTreeMap::new());
static TERMINATOR: Once<Arc<WorkQueue>> = Once::new();

fn thread_res() -> &'static ResArena {
    THREAD_RES.call_once(|| ResArena::new("thread", 0, MAX_THREADS - 1))
}

/// Creates a thread in CREATED state. Returns `None` when the TID space
/// or memory is exhausted.
pub fn create_thread(
    entry: ThreadEntry,
    arg: usize,
    name: &'static str,
    policy: Policy,
    prio: u8,
    flags: ThreadFlags,
) -> Option<Arc<Thread>> {
    let tid = thread_res().alloc()?;
    let mut flags = flags;
    match policy {
        Policy::Fifo => flags |= ThreadFlags::FIFO | ThreadFlags::FIXED_PRIO,
        Policy::Rr => flags |= ThreadFlags::FIXED_PRIO,
        Policy::Normal => {}
    }
    let ctx = match arch::alloc_context(thread_entry_trampoline) {
        Some(c) => c,
        None => {
            thread_res().free(tid);
            return None;
        }
    };
    let sp = ctx.sp;
    let thread = Arc::new(Thread {
        tid,
        name,
        entry,
        arg,
        policy,
        flags,
        quantum: sched::TIMESLICE_LEN,
        sched: Mutex::new(ThreadSched {
            state: ThreadState::Created,
            priority: prio,
            quanta_left: 0,
            preempted: false,
            timeout_pending: false,
            ref_count: 1,
            exit_code: 0,
            last_schedule: 0,
            run_time: 0,
            wait: None,
            owned_waits: Vec::new(),
        }),
        wait_asserted: AtomicBool::new(false),
        join_queue: WaitQueue::new(WaitType::Queue),
        timeout: time::new_event(),
        sp: SpCell(UnsafeCell::new(sp)),
        _ctx: Mutex::new(Some(ctx)),
    });
    THREAD_TABLE.lock().insert(tid, thread.clone());
    Some(thread)
}

/// First code of every thread. The incoming switch happened at IPL high;
/// open interrupts back up, then run the entry function.
pub extern "C" fn thread_entry_trampoline() {
    platform::lower_ipl(IPL_LOW);
    let thread = sched::current_thread().expect("trampoline without current thread");
    (thread.entry_fn())(thread.arg());
    terminate_self(0);
}

/// Looks up a thread by TID.
pub fn get_thread(tid: u32) -> Option<Arc<Thread>> {
    THREAD_TABLE.lock().get(&tid).cloned()
}

pub fn ref_thread(thread: &Arc<Thread>) {
    thread.sched.lock().ref_count += 1;
}

/// Drops a reference; the last one releases the TID and the thread's
/// resources.
pub fn destroy_thread(thread: &Arc<Thread>) {
    let last = {
        let mut ts = thread.sched.lock();
        ts.ref_count -= 1;
        ts.ref_count == 0
    };
    if last {
        THREAD_TABLE.lock().remove(&thread.tid);
        *thread._ctx.lock() = None;
        thread_res().free(thread.tid);
    }
}

/// Terminates the calling thread: wakes joiners, releases owned wait
/// objects, and hands the carcass to the terminator.
pub fn terminate_self(code: i32) -> ! {
    platform::raise_ipl(IPL_HIGH);
    let thread = sched::current_thread().expect("terminate without current thread");
    {
        let mut ts = thread.sched.lock();
        assert_eq!(ts.state, ThreadState::Running);
        ts.state = ThreadState::Terminating;
        ts.exit_code = code;
    }
    // Wake joiners, and close the queue so a late join returns at once
    thread.join_queue.broadcast();
    thread.join_queue.close();
    // Release every wait object we own
    let owned: Vec<Arc<WaitObj>> = {
        let mut ts = thread.sched.lock();
        ts.owned_waits.drain(..).collect()
    };
    for wobj in owned {
        if wait::clear_wait(&wobj, wait::WAIT_SUCCESS) {
            sched::wake_obj(&wobj);
        }
    }
    // Only queue for destruction if dropping our reference would actually
    // destroy; otherwise a joiner still holds the thread and cleans up
    let submit = {
        let mut ts = thread.sched.lock();
        if ts.ref_count == 1 {
            true
        } else {
            ts.ref_count -= 1;
            false
        }
    };
    if submit {
        if let Some(term) = TERMINATOR.get() {
            work::submit(term, thread.clone());
        } else {
            destroy_thread(&thread);
        }
    }
    sched::schedule();
    unreachable!("terminated thread rescheduled");
}

fn terminator_work(item: &work::WorkItem) {
    let thread = item
        .data
        .clone()
        .downcast::<Thread>()
        .expect("terminator fed a non-thread");
    assert_eq!(thread.state(), ThreadState::Terminating);
    destroy_thread(&thread);
}

/// Spawns the terminator work queue.
pub fn init_terminator() {
    TERMINATOR.call_once(|| {
        work::create_queue(
            "terminator",
            terminator_work,
            sched::PRIO_WORKER,
            TERMINATOR_THRESHOLD,
        )
    });
}

/// Asserts a wait for the current thread. Caller is at IPL high and holds
/// the target's lock.
pub fn assert_wait(timeout: u64, obj: usize, ty: WaitType) -> Arc<WaitObj> {
    let thread = sched::current_thread().expect("wait without current thread");
    assert_wait_on(&thread, timeout, obj, ty)
}

pub(crate) fn assert_wait_on(
    thread: &Arc<Thread>,
    timeout: u64,
    obj: usize,
    ty: WaitType,
) -> Arc<WaitObj> {
    {
        let mut ts = thread.sched.lock();
        assert!(
            ts.state != ThreadState::Waiting && !thread.wait_asserted(),
            "wait already asserted"
        );
        ts.state = ThreadState::Waiting;
    }
    thread.set_assert(true);
    let wobj = WaitObj::new(thread, ty, timeout, obj);
    thread.sched.lock().wait = Some(wobj.clone());
    if timeout > 0 {
        thread.sched.lock().timeout_pending = true;
        time::set_wake_event(&thread.timeout, wobj.clone());
        time::reg_event(&thread.timeout, timeout, false);
    }
    wobj
}

/// Blocks on an asserted wait. True on success; on success with `own`
/// the object joins the thread's owned list.
pub fn wait_on_obj(wobj: &Arc<WaitObj>, own: bool) -> bool {
    sched::schedule();
    if wobj.result() != wait::WAIT_SUCCESS {
        return false;
    }
    if own {
        let thread = sched::current_thread().expect("no current thread");
        thread.sched.lock().owned_waits.push(wobj.clone());
        wobj.set_owner(&thread);
    }
    true
}

/// Yields the CPU.
pub fn yield_now() {
    let ipl = platform::raise_ipl(IPL_HIGH);
    sched::schedule();
    platform::lower_ipl(ipl);
}

/// Admits a created thread to the scheduler.
pub fn start_thread(thread: &Arc<Thread>) {
    let ipl = platform::raise_ipl(IPL_HIGH);
    sched::ready_thread(thread);
    platform::lower_ipl(ipl);
}

/// Sleeps for at least `ns` nanoseconds.
pub fn sleep_thread(ns: u64) {
    // A private queue nobody wakes; the timeout is the wakeup
    let queue = WaitQueue::new(WaitType::Queue);
    let _ = queue.wait_timeout(ns);
}

/// Blocks until `thread` terminates, then drops the joiner's reference.
pub fn join_thread(thread: &Arc<Thread>) -> KResult<()> {
    ref_thread(thread);
    let res = thread.join_queue.wait();
    if res.is_ok() {
        destroy_thread(thread);
    }
    res
}

/// `join_thread` with a timeout.
pub fn join_thread_timeout(thread: &Arc<Thread>, timeout: u64) -> KResult<()> {
    ref_thread(thread);
    let res = thread.join_queue.wait_timeout(timeout);
    match res {
        Ok(()) => {
            destroy_thread(thread);
            Ok(())
        }
        Err(e) => {
            // Timed out: give our reference back
            destroy_thread(thread);
            Err(e)
        }
    }
}

#[cfg(test)]
pub mod testing {
    //! Thread construction helpers for hosted tests.

    use super::*;

    fn nop_entry(_arg: usize) {}

    /// A bare thread for scheduler and wait tests.
    pub fn bare_thread(name: &'static str, prio: u8) -> Arc<Thread> {
        create_thread(
            nop_entry,
            0,
            name,
            Policy::Normal,
            prio,
            ThreadFlags::empty(),
        )
        .expect("thread creation failed")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use testing::bare_thread;

    #[test]
    fn test_create_assigns_unique_tids() {
        let _guard = crate::ccb::testing::lock();
        let a = bare_thread("a", 10);
        let b = bare_thread("b", 11);
        assert_ne!(a.tid(), b.tid());
        assert_eq!(a.state(), ThreadState::Created);
        assert!(get_thread(a.tid()).is_some());
        destroy_thread(&a);
        destroy_thread(&b);
        assert!(get_thread(a.tid()).is_none());
    }

    #[test]
    fn test_policy_sets_flags() {
        let _guard = crate::ccb::testing::lock();
        let f = create_thread(
            |_| {},
            0,
            "fifo",
            Policy::Fifo,
            5,
            ThreadFlags::empty(),
        )
        .unwrap();
        assert!(f.flags().contains(ThreadFlags::FIFO | ThreadFlags::FIXED_PRIO));
        let r = create_thread(|_| {}, 0, "rr", Policy::Rr, 5, ThreadFlags::empty()).unwrap();
        assert!(r.flags().contains(ThreadFlags::FIXED_PRIO));
        assert!(!r.flags().contains(ThreadFlags::FIFO));
        destroy_thread(&f);
        destroy_thread(&r);
    }

    #[test]
    fn test_refcount_delays_destruction() {
        let _guard = crate::ccb::testing::lock();
        let t = bare_thread("ref", 10);
        ref_thread(&t);
        destroy_thread(&t);
        assert!(get_thread(t.tid()).is_some());
        destroy_thread(&t);
        assert!(get_thread(t.tid()).is_none());
    }

    #[test]
    fn test_assert_wait_marks_thread() {
        let _guard = crate::ccb::testing::lock();
        let t = bare_thread("asserted", 12);
        let wobj = assert_wait_on(&t, 0, 0xABC, WaitType::Queue);
        assert_eq!(t.state(), ThreadState::Waiting);
        assert!(t.wait_asserted());
        assert_eq!(wobj.obj, 0xABC);
        assert_eq!(wobj.result(), wait::WAIT_IN_PROG);
        t.set_assert(false);
        assert!(wait::clear_wait(&wobj, wait::WAIT_SUCCESS));
        destroy_thread(&t);
    }

    #[test]
    fn test_assert_wait_with_timeout_registers_event() {
        let _guard = crate::ccb::testing::lock();
        crate::platform::testing::install_mock_time();
        crate::platform::interrupt::testing::install_mock_ctrl();
        let t = bare_thread("timed", 12);
        let wobj = assert_wait_on(&t, 50_000_000, 0, WaitType::Queue);
        assert!(t.timeout_event().in_use());
        assert!(t.sched.lock().timeout_pending);
        // Success path deregisters the timeout
        t.set_assert(false);
        assert!(wait::clear_wait(&wobj, wait::WAIT_SUCCESS));
        assert!(!t.timeout_event().in_use());
        assert!(!t.sched.lock().timeout_pending);
        destroy_thread(&t);
    }

    #[test]
    fn test_wait_timeout_path_wakes_with_timeout_result() {
        // S6 shape: a 50 ms wait with nobody waking it expires through
        // the timer and readies the thread with a TIMEOUT result.
        let _guard = crate::ccb::testing::lock();
        crate::task::sched::testing::reset();
        crate::platform::testing::install_mock_time();
        crate::platform::interrupt::testing::install_mock_ctrl();
        let clock = &crate::platform::testing::MOCK_CLOCK;
        let t = bare_thread("sleeper", 14);
        let wobj = assert_wait_on(&t, 50_000_000, 0, WaitType::Queue);
        t.set_assert(false); // parked
        clock
            .now
            .fetch_add(50_000_001, core::sync::atomic::Ordering::SeqCst);
        time::time_handler();
        assert_eq!(wobj.result(), wait::WAIT_TIMEOUT);
        assert_eq!(t.state(), ThreadState::Ready);
        let st = crate::ccb::ccb().sched.lock();
        assert!(st.ready_mask & (1 << 14) != 0);
        drop(st);
        crate::task::sched::testing::reset();
        destroy_thread(&t);
    }
}
