// Work queues: a serial consumer thread drains deferred work items.
// Used by the thread terminator; demand driven with threshold batching.

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use core::any::Any;
use core::sync::atomic::{AtomicU64, Ordering};
use spin::{Mutex, Once};

use super::sched::Policy;
use super::thread::{self, Thread, ThreadFlags};
use super::wait::{WaitQueue, WaitType};
use crate::ccb::IPL_HIGH;
use crate::platform;

pub type WorkCallback = fn(&WorkItem);

pub struct WorkItem {
    pub id: u64,
    pub data: Arc<dyn Any + Send + Sync>,
}

struct WorkState {
    items: VecDeque<WorkItem>,
    next_id: u64,
}

pub struct WorkQueue {
    state: Mutex<WorkState>,
    wait: WaitQueue,
    cb: WorkCallback,
    threshold: usize,
    worker: Once<Arc<Thread>>,
}

static NUM_QUEUES: AtomicU64 = AtomicU64::new(0);

impl WorkQueue {
    pub fn num_pending(&self) -> usize {
        self.state.lock().items.len()
    }
}

/// Creates a work queue and starts its consumer thread.
pub fn create_queue(
    name: &'static str,
    cb: WorkCallback,
    prio: u8,
    threshold: usize,
) -> Arc<WorkQueue> {
    let queue = Arc::new(WorkQueue {
        state: Mutex::new(WorkState {
            items: VecDeque::new(),
            next_id: 1,
        }),
        wait: WaitQueue::new(WaitType::Condition),
        cb,
        threshold,
        worker: Once::new(),
    });
    NUM_QUEUES.fetch_add(1, Ordering::Relaxed);
    // The worker owns a raw reference to the queue for its lifetime
    let arg = Arc::into_raw(queue.clone()) as usize;
    let worker = thread::create_thread(
        worker_entry,
        arg,
        name,
        Policy::Normal,
        prio,
        ThreadFlags::empty(),
    )
    .expect("can't create work queue thread");
    queue.worker.call_once(|| worker.clone());
    thread::start_thread(&worker);
    queue
}

fn worker_entry(arg: usize) {
    let queue = unsafe { Arc::from_raw(arg as *const WorkQueue) };
    loop {
        let item = {
            let ipl = platform::raise_ipl(IPL_HIGH);
            let item = queue.state.lock().items.pop_front();
            platform::lower_ipl(ipl);
            item
        };
        match item {
            Some(item) => (queue.cb)(&item),
            None => {
                let _ = queue.wait.wait();
            }
        }
    }
}

/// Submits work; the consumer is kicked once the backlog reaches the
/// queue's threshold. Returns the item id for `cancel`.
pub fn submit(queue: &Arc<WorkQueue>, data: Arc<dyn Any + Send + Sync>) -> u64 {
    let ipl = platform::raise_ipl(IPL_HIGH);
    let (id, kick) = {
        let mut st = queue.state.lock();
        let id = st.next_id;
        st.next_id += 1;
        st.items.push_back(WorkItem { id, data });
        (id, st.items.len() >= queue.threshold)
    };
    platform::lower_ipl(ipl);
    if kick {
        queue.wait.wake_one();
    }
    id
}

/// Cancels a pending item. False if it already ran (or never existed).
pub fn cancel(queue: &Arc<WorkQueue>, id: u64) -> bool {
    let ipl = platform::raise_ipl(IPL_HIGH);
    let mut st = queue.state.lock();
    let before = st.items.len();
    st.items.retain(|item| item.id != id);
    let removed = st.items.len() != before;
    drop(st);
    platform::lower_ipl(ipl);
    removed
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nop_work(_item: &WorkItem) {}

    #[test]
    fn test_submit_and_cancel() {
        let _guard = crate::ccb::testing::lock();
        crate::task::sched::testing::reset();
        let q = create_queue("test-work", nop_work, 50, 100);
        let a = submit(&q, Arc::new(1u32));
        let b = submit(&q, Arc::new(2u32));
        assert_ne!(a, b);
        assert_eq!(q.num_pending(), 2);
        assert!(cancel(&q, a));
        assert!(!cancel(&q, a));
        assert_eq!(q.num_pending(), 1);
        assert!(cancel(&q, b));
        crate::task::sched::testing::reset();
    }
}
