// Wait objects and wait queues. A wait object is the one-shot handle
// between a waiting thread and its target; its result field is the single
// atomic handoff between the success and timeout paths.

use alloc::collections::VecDeque;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, Ordering};
use spin::Mutex;

use super::sched;
use super::thread::{self, Thread};
use crate::ccb::IPL_HIGH;
use crate::klib::error::{KResult, KernelError};
use crate::platform::{self, time};

pub const WAIT_IN_PROG: u32 = 0;
pub const WAIT_SUCCESS: u32 = 1;
pub const WAIT_TIMEOUT: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitType {
    Timer,
    Msg,
    Semaphore,
    Condition,
    Mutex,
    Queue,
}

/// A thread's wait on one target. Created by `assert_wait`, resolved by
/// exactly one `clear_wait`.
pub struct WaitObj {
    pub waiter: Weak<Thread>,
    pub ty: WaitType,
    pub timeout: u64,
    /// Token identifying the target object.
    pub obj: usize,
    result: AtomicU32,
    owner: Mutex<Option<Weak<Thread>>>,
}

impl WaitObj {
    pub(super) fn new(waiter: &Arc<Thread>, ty: WaitType, timeout: u64, obj: usize) -> Arc<WaitObj> {
        Arc::new(WaitObj {
            waiter: Arc::downgrade(waiter),
            ty,
            timeout,
            obj,
            result: AtomicU32::new(WAIT_IN_PROG),
            owner: Mutex::new(None),
        })
    }

    pub fn result(&self) -> u32 {
        self.result.load(Ordering::SeqCst)
    }

    pub(super) fn set_owner(&self, owner: &Arc<Thread>) {
        *self.owner.lock() = Some(Arc::downgrade(owner));
    }
}

/// Resolves a wait. The first caller wins and deregisters the loser's
/// path; a later call observes the transition and reports failure.
pub fn clear_wait(wobj: &Arc<WaitObj>, result: u32) -> bool {
    debug_assert!(result == WAIT_SUCCESS || result == WAIT_TIMEOUT);
    let waiter = match wobj.waiter.upgrade() {
        Some(t) => t,
        None => return false,
    };
    // The waiter publishes "safely parked" by dropping its assert flag in
    // the scheduler's stop hook; don't touch the wait before that.
    waiter.check_assert();
    if wobj
        .result
        .compare_exchange(WAIT_IN_PROG, result, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        return false;
    }
    if result != WAIT_TIMEOUT && wobj.timeout > 0 {
        time::dereg_event(waiter.timeout_event());
        waiter.sched.lock().timeout_pending = false;
    }
    true
}

struct WqState {
    waiters: VecDeque<Arc<WaitObj>>,
    closed: bool,
}

/// A queue of waiting threads with open/close semantics. Closing wakes
/// everyone and makes later waits return immediately.
pub struct WaitQueue {
    ty: WaitType,
    state: Mutex<WqState>,
}

impl WaitQueue {
    pub const fn new(ty: WaitType) -> WaitQueue {
        WaitQueue {
            ty,
            state: Mutex::new(WqState {
                waiters: VecDeque::new(),
                closed: false,
            }),
        }
    }

    pub fn num_waiters(&self) -> usize {
        self.state.lock().waiters.len()
    }

    /// Blocks until woken.
    pub fn wait(&self) -> KResult<()> {
        self.wait_timeout(0)
    }

    /// Blocks until woken or `timeout` ns pass (0 means forever).
    pub fn wait_timeout(&self, timeout: u64) -> KResult<()> {
        let ipl = platform::raise_ipl(IPL_HIGH);
        let wobj = {
            let mut st = self.state.lock();
            if st.closed {
                drop(st);
                platform::lower_ipl(ipl);
                return Ok(());
            }
            // Assert under the queue lock so a waker can't slip between
            // the check and the park
            let wobj = thread::assert_wait(timeout, self as *const _ as usize, self.ty);
            st.waiters.push_back(wobj.clone());
            wobj
        };
        let ok = thread::wait_on_obj(&wobj, false);
        if !ok {
            // Timed out: pull the stale wait out of the queue
            self.state
                .lock()
                .waiters
                .retain(|w| !Arc::ptr_eq(w, &wobj));
        }
        platform::lower_ipl(ipl);
        if ok {
            Ok(())
        } else {
            Err(KernelError::TimedOut)
        }
    }

    /// Wakes the first still-pending waiter. Returns false if none.
    pub fn wake_one(&self) -> bool {
        let ipl = platform::raise_ipl(IPL_HIGH);
        let woke = loop {
            let next = self.state.lock().waiters.pop_front();
            match next {
                Some(wobj) => {
                    if clear_wait(&wobj, WAIT_SUCCESS) {
                        sched::wake_obj(&wobj);
                        break true;
                    }
                    // Lost to a timeout; try the next waiter
                }
                None => break false,
            }
        };
        platform::lower_ipl(ipl);
        woke
    }

    /// Wakes every pending waiter.
    pub fn broadcast(&self) {
        let ipl = platform::raise_ipl(IPL_HIGH);
        let drained: Vec<Arc<WaitObj>> = {
            let mut st = self.state.lock();
            st.waiters.drain(..).collect()
        };
        for wobj in drained {
            if clear_wait(&wobj, WAIT_SUCCESS) {
                sched::wake_obj(&wobj);
            }
        }
        platform::lower_ipl(ipl);
    }

    /// Closes the queue: wakes everyone, later waits succeed immediately.
    pub fn close(&self) {
        {
            let mut st = self.state.lock();
            st.closed = true;
        }
        self.broadcast();
    }
}

/// Counting semaphore. The wait is asserted under the semaphore's own
/// lock, so a release cannot race a sleeper into a lost wakeup.
pub struct Semaphore {
    state: Mutex<SemState>,
}

struct SemState {
    count: i64,
    waiters: VecDeque<Arc<WaitObj>>,
}

impl Semaphore {
    pub const fn new(count: i64) -> Semaphore {
        Semaphore {
            state: Mutex::new(SemState {
                count,
                waiters: VecDeque::new(),
            }),
        }
    }

    pub fn try_acquire(&self) -> bool {
        let ipl = platform::raise_ipl(IPL_HIGH);
        let mut st = self.state.lock();
        let got = st.count > 0;
        if got {
            st.count -= 1;
        }
        drop(st);
        platform::lower_ipl(ipl);
        got
    }

    pub fn acquire(&self) -> KResult<()> {
        self.acquire_timeout(0)
    }

    pub fn acquire_timeout(&self, timeout: u64) -> KResult<()> {
        loop {
            let ipl = platform::raise_ipl(IPL_HIGH);
            let wobj = {
                let mut st = self.state.lock();
                if st.count > 0 {
                    st.count -= 1;
                    drop(st);
                    platform::lower_ipl(ipl);
                    return Ok(());
                }
                let wobj = thread::assert_wait(
                    timeout,
                    self as *const _ as usize,
                    WaitType::Semaphore,
                );
                st.waiters.push_back(wobj.clone());
                wobj
            };
            let ok = thread::wait_on_obj(&wobj, false);
            if !ok {
                self.state
                    .lock()
                    .waiters
                    .retain(|w| !Arc::ptr_eq(w, &wobj));
                platform::lower_ipl(ipl);
                return Err(KernelError::TimedOut);
            }
            platform::lower_ipl(ipl);
            // Woken with the token handed over; re-check under the lock
        }
    }

    pub fn release(&self) {
        let ipl = platform::raise_ipl(IPL_HIGH);
        loop {
            let next = {
                let mut st = self.state.lock();
                match st.waiters.pop_front() {
                    Some(w) => w,
                    None => {
                        st.count += 1;
                        break;
                    }
                }
            };
            if clear_wait(&next, WAIT_SUCCESS) {
                // Hand the token over; the woken waiter re-checks under
                // the lock and takes it
                self.state.lock().count += 1;
                sched::wake_obj(&next);
                break;
            }
        }
        platform::lower_ipl(ipl);
    }
}

/// Sleeping mutex for thread context.
pub struct KMutex {
    sem: Semaphore,
}

impl KMutex {
    pub const fn new() -> KMutex {
        KMutex {
            sem: Semaphore::new(1),
        }
    }

    pub fn lock(&self) {
        let _ = self.sem.acquire();
    }

    pub fn try_lock(&self) -> bool {
        self.sem.try_acquire()
    }

    pub fn unlock(&self) {
        self.sem.release();
    }
}

/// Condition variable over a wait queue.
pub struct Condition {
    queue: WaitQueue,
}

impl Condition {
    pub const fn new() -> Condition {
        Condition {
            queue: WaitQueue::new(WaitType::Condition),
        }
    }

    /// Atomically drops `mutex` and waits; relocks before returning.
    pub fn wait(&self, mutex: &KMutex) -> KResult<()> {
        mutex.unlock();
        let res = self.queue.wait();
        mutex.lock();
        res
    }

    pub fn wait_timeout(&self, mutex: &KMutex, timeout: u64) -> KResult<()> {
        mutex.unlock();
        let res = self.queue.wait_timeout(timeout);
        mutex.lock();
        res
    }

    pub fn signal(&self) -> bool {
        self.queue.wake_one()
    }

    pub fn broadcast(&self) {
        self.queue.broadcast()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::thread::testing::bare_thread;

    #[test]
    fn test_clear_wait_single_winner() {
        let _guard = crate::ccb::testing::lock();
        let t = bare_thread("waiter", 30);
        let wobj = crate::task::thread::assert_wait_on(&t, 0, 0x1234, WaitType::Queue);
        assert_eq!(wobj.result(), WAIT_IN_PROG);
        // Simulate the scheduler's stop hook publishing the park
        t.set_assert(false);
        assert!(clear_wait(&wobj, WAIT_SUCCESS));
        assert_eq!(wobj.result(), WAIT_SUCCESS);
        // The loser observes the handoff
        assert!(!clear_wait(&wobj, WAIT_TIMEOUT));
        assert_eq!(wobj.result(), WAIT_SUCCESS);
    }

    #[test]
    fn test_wake_one_readies_waiter() {
        let _guard = crate::ccb::testing::lock();
        crate::task::sched::testing::reset();
        let queue = WaitQueue::new(WaitType::Queue);
        let t = bare_thread("sleeper", 20);
        let wobj = crate::task::thread::assert_wait_on(&t, 0, &queue as *const _ as usize, WaitType::Queue);
        queue.state.lock().waiters.push_back(wobj.clone());
        t.set_assert(false);
        assert!(queue.wake_one());
        assert_eq!(wobj.result(), WAIT_SUCCESS);
        // The waiter is back on its ready queue
        let st = crate::ccb::ccb().sched.lock();
        assert!(st.ready_mask & (1 << 20) != 0);
        drop(st);
        crate::task::sched::testing::reset();
    }

    #[test]
    fn test_wake_one_skips_timed_out_waiters() {
        let _guard = crate::ccb::testing::lock();
        crate::task::sched::testing::reset();
        let queue = WaitQueue::new(WaitType::Queue);
        let t1 = bare_thread("lost", 20);
        let w1 = crate::task::thread::assert_wait_on(&t1, 0, 0, WaitType::Queue);
        let t2 = bare_thread("won", 21);
        let w2 = crate::task::thread::assert_wait_on(&t2, 0, 0, WaitType::Queue);
        queue.state.lock().waiters.push_back(w1.clone());
        queue.state.lock().waiters.push_back(w2.clone());
        t1.set_assert(false);
        t2.set_assert(false);
        // First waiter already timed out
        assert!(clear_wait(&w1, WAIT_TIMEOUT));
        assert!(queue.wake_one());
        assert_eq!(w2.result(), WAIT_SUCCESS);
        assert_eq!(queue.num_waiters(), 0);
        crate::task::sched::testing::reset();
    }

    #[test]
    fn test_semaphore_try_acquire() {
        let _guard = crate::ccb::testing::lock();
        let sem = Semaphore::new(2);
        assert!(sem.try_acquire());
        assert!(sem.try_acquire());
        assert!(!sem.try_acquire());
        sem.release();
        assert!(sem.try_acquire());
    }
}
