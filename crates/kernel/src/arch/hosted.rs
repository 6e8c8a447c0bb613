// Hosted arch backend. Implements the CPU surface with plain state so the
// machine-independent core can run under the unit test harness (and type
// check on non-x86 hosts). Nothing here touches real hardware.

use alloc::boxed::Box;
use alloc::vec;
use core::sync::atomic::{AtomicBool, Ordering};

static INTS_ENABLED: AtomicBool = AtomicBool::new(false);
static INTS_HELD: AtomicBool = AtomicBool::new(true);

pub fn disable() {
    INTS_ENABLED.store(false, Ordering::SeqCst);
}

pub fn enable() {
    if !INTS_HELD.load(Ordering::SeqCst) {
        INTS_ENABLED.store(true, Ordering::SeqCst);
    }
}

pub fn ints_enabled() -> bool {
    INTS_ENABLED.load(Ordering::SeqCst)
}

pub fn hold_ints() {
    INTS_HELD.store(true, Ordering::SeqCst);
    INTS_ENABLED.store(false, Ordering::SeqCst);
}

pub fn unhold_ints() {
    INTS_HELD.store(false, Ordering::SeqCst);
    INTS_ENABLED.store(true, Ordering::SeqCst);
}

pub fn halt() {}

pub fn crash() -> ! {
    #[cfg(test)]
    panic!("cpu crash");
    #[cfg(not(test))]
    loop {}
}

/// Saved thread context. The hosted backend cannot switch stacks; the
/// scheduler paths that would are not exercised hosted.
pub struct ThreadContext {
    #[allow(dead_code)]
    stack: Box<[u8]>,
    pub sp: usize,
}

pub fn alloc_context(_entry: extern "C" fn()) -> Option<ThreadContext> {
    Some(ThreadContext {
        stack: vec![0u8; 0].into_boxed_slice(),
        sp: 0,
    })
}

/// # Safety
/// Never callable hosted; present so the scheduler compiles unchanged.
pub unsafe fn switch_context(_old_sp: *mut usize, _new_sp: usize) {
    unreachable!("context switch on hosted arch");
}

/// Trap frame for the hosted backend; carries just enough for dispatch.
#[derive(Debug, Clone, Copy, Default)]
pub struct TrapFrame {
    pub int_no: u64,
    pub err_code: u64,
}

impl TrapFrame {
    pub fn int_num(&self) -> u32 {
        self.int_no as u32
    }
}
