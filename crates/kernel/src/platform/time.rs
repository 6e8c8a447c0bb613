// Time events: deadlines bound to a callback or a thread wake-up, kept in
// a per-CPU deadline-ordered list and drained from timer interrupt
// context.

use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

use super::platform;
use crate::ccb::{ccb, IPL_HIGH};
use crate::task::wait::{self, WaitObj};

pub type TimeCallback = fn(&Arc<TimeEvent>, usize);

#[derive(Clone)]
pub enum EventKind {
    None,
    /// Run a callback in timer-interrupt context.
    Callback(TimeCallback, usize),
    /// Time out a wait object.
    Wake(Arc<WaitObj>),
}

pub struct TimeEventState {
    pub deadline: u64,
    pub delta: u64,
    pub kind: EventKind,
    pub in_use: bool,
    pub expired: bool,
    pub periodic: bool,
}

pub struct TimeEvent {
    state: Mutex<TimeEventState>,
}

impl TimeEvent {
    pub fn state(&self) -> spin::MutexGuard<'_, TimeEventState> {
        self.state.lock()
    }

    pub fn in_use(&self) -> bool {
        self.state.lock().in_use
    }

    pub fn expired(&self) -> bool {
        self.state.lock().expired
    }
}

/// The CCB's deadline-ordered event list.
pub struct TimeEventList {
    events: Vec<Arc<TimeEvent>>,
}

impl TimeEventList {
    pub const fn new() -> Self {
        Self { events: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    fn insert_sorted(&mut self, evt: Arc<TimeEvent>) {
        let deadline = evt.state.lock().deadline;
        let pos = self
            .events
            .iter()
            .position(|e| e.state.lock().deadline > deadline)
            .unwrap_or(self.events.len());
        self.events.insert(pos, evt);
    }
}

/// Current monotonic time, zero before a clock is installed.
pub fn now() -> u64 {
    platform().clock_opt().map(|c| c.get_time()).unwrap_or(0)
}

/// Allocates an unarmed event.
pub fn new_event() -> Arc<TimeEvent> {
    Arc::new(TimeEvent {
        state: Mutex::new(TimeEventState {
            deadline: 0,
            delta: 0,
            kind: EventKind::None,
            in_use: false,
            expired: false,
            periodic: false,
        }),
    })
}

pub fn set_cb_event(evt: &Arc<TimeEvent>, cb: TimeCallback, arg: usize) {
    evt.state.lock().kind = EventKind::Callback(cb, arg);
}

pub fn set_wake_event(evt: &Arc<TimeEvent>, waiter: Arc<WaitObj>) {
    evt.state.lock().kind = EventKind::Wake(waiter);
}

fn arm_for(delta: u64) {
    if let Some(timer) = platform().timer_opt() {
        if !timer.is_soft() {
            timer.arm_timer(delta);
        }
    }
}

/// Registers an event to fire `delta` ns from now.
pub fn reg_event(evt: &Arc<TimeEvent>, delta: u64, periodic: bool) {
    let ipl = super::raise_ipl(IPL_HIGH);
    let now = now();
    {
        let mut st = evt.state.lock();
        assert!(!st.in_use, "time event already registered");
        st.delta = delta;
        st.deadline = now + delta;
        st.periodic = periodic;
        st.in_use = true;
        st.expired = false;
    }
    let front = {
        let mut list = ccb().time_events.lock();
        list.insert_sorted(evt.clone());
        Arc::ptr_eq(&list.events[0], evt)
    };
    // A new earliest deadline retargets the hardware timer
    if front {
        arm_for(delta);
    }
    super::lower_ipl(ipl);
}

/// Deregisters a pending event; a no-op if it already fired.
pub fn dereg_event(evt: &Arc<TimeEvent>) {
    let ipl = super::raise_ipl(IPL_HIGH);
    let rearm = {
        let mut list = ccb().time_events.lock();
        let was_front = list
            .events
            .first()
            .map(|e| Arc::ptr_eq(e, evt))
            .unwrap_or(false);
        list.events.retain(|e| !Arc::ptr_eq(e, evt));
        evt.state.lock().in_use = false;
        if was_front {
            list.events.first().cloned()
        } else {
            None
        }
    };
    if let Some(next) = rearm {
        let deadline = next.state.lock().deadline;
        arm_for(deadline.saturating_sub(now()));
    }
    super::lower_ipl(ipl);
}

/// Drains expired events. Runs in timer-interrupt context; the hardware
/// (or the software-timer tick) calls this on every expiry.
pub fn time_handler() {
    let now_ns = now();
    let mut fired: Vec<Arc<TimeEvent>> = Vec::new();
    {
        let mut list = ccb().time_events.lock();
        loop {
            let due = match list.events.first() {
                Some(front) => front.state.lock().deadline <= now_ns,
                None => false,
            };
            if !due {
                break;
            }
            let evt = list.events.remove(0);
            {
                let mut st = evt.state.lock();
                st.expired = true;
                st.in_use = false;
            }
            fired.push(evt);
        }
    }
    for evt in fired {
        let (kind, periodic, delta) = {
            let st = evt.state.lock();
            (st.kind.clone(), st.periodic, st.delta)
        };
        match kind {
            EventKind::None => {}
            EventKind::Callback(cb, arg) => cb(&evt, arg),
            EventKind::Wake(waiter) => {
                // The success path may have won already; only a real
                // transition wakes the thread
                if wait::clear_wait(&waiter, wait::WAIT_TIMEOUT) {
                    crate::task::sched::wake_obj(&waiter);
                }
            }
        }
        if periodic {
            reg_event(&evt, delta, true);
        }
    }
    // Rearm a one-shot timer for the next deadline
    let next = {
        let list = ccb().time_events.lock();
        list.events.first().cloned()
    };
    if let Some(next) = next {
        let deadline = next.state.lock().deadline;
        arm_for(deadline.saturating_sub(now_ns));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::HwClock;
    use core::sync::atomic::{AtomicUsize, Ordering};

    fn setup() {
        crate::platform::testing::install_mock_time();
        crate::platform::interrupt::testing::install_mock_ctrl();
    }

    static CB_COUNT: AtomicUsize = AtomicUsize::new(0);

    fn count_cb(_evt: &Arc<TimeEvent>, arg: usize) {
        CB_COUNT.fetch_add(arg, Ordering::SeqCst);
    }

    #[test]
    fn test_events_sorted_and_fired_in_order() {
        let _guard = crate::ccb::testing::lock();
        setup();
        let clock = &crate::platform::testing::MOCK_CLOCK;
        let base = clock.get_time();
        CB_COUNT.store(0, Ordering::SeqCst);
        let late = new_event();
        set_cb_event(&late, count_cb, 10);
        let soon = new_event();
        set_cb_event(&soon, count_cb, 1);
        reg_event(&late, 5_000, false);
        reg_event(&soon, 1_000, false);
        {
            let list = ccb().time_events.lock();
            assert_eq!(list.len(), 2);
            assert!(Arc::ptr_eq(&list.events[0], &soon));
        }
        // Only the near deadline expires
        clock.now.store(base + 2_000, Ordering::SeqCst);
        time_handler();
        assert_eq!(CB_COUNT.load(Ordering::SeqCst), 1);
        assert!(soon.expired());
        assert!(!late.expired());
        clock.now.store(base + 6_000, Ordering::SeqCst);
        time_handler();
        assert_eq!(CB_COUNT.load(Ordering::SeqCst), 11);
        assert!(ccb().time_events.lock().is_empty());
    }

    #[test]
    fn test_periodic_event_rearms() {
        let _guard = crate::ccb::testing::lock();
        setup();
        let clock = &crate::platform::testing::MOCK_CLOCK;
        let base = clock.get_time();
        CB_COUNT.store(0, Ordering::SeqCst);
        let evt = new_event();
        set_cb_event(&evt, count_cb, 1);
        reg_event(&evt, 1_000, true);
        for tick in 1..=3 {
            clock
                .now
                .store(base + tick * 1_000 + 1, Ordering::SeqCst);
            time_handler();
            assert_eq!(CB_COUNT.load(Ordering::SeqCst), tick as usize);
            assert!(evt.in_use());
        }
        dereg_event(&evt);
        assert!(ccb().time_events.lock().is_empty());
    }

    #[test]
    fn test_dereg_rearms_for_next() {
        let _guard = crate::ccb::testing::lock();
        setup();
        let timer = &crate::platform::testing::MOCK_TIMER;
        let soon = new_event();
        let late = new_event();
        reg_event(&soon, 1_000, false);
        reg_event(&late, 9_000, false);
        dereg_event(&soon);
        // The timer is retargeted at the surviving deadline
        assert!(timer.armed.load(Ordering::SeqCst) >= 8_000);
        dereg_event(&late);
        assert!(!soon.in_use());
        assert!(!late.in_use());
    }
}
