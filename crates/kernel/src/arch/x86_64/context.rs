// Thread context switching. Context lives on the thread's kernel stack;
// the saved context pointer is just the stack pointer, so a switch is a
// callee-saved push/pop pair around an RSP swap.

use alloc::boxed::Box;
use alloc::vec;

/// Kernel stack size per thread. Must cover nested interrupt frames plus
/// whatever the thread calls into.
pub const KERNEL_STACK_SIZE: usize = 4096 * 8;

core::arch::global_asm!(
    ".global nexke_switch_context",
    "nexke_switch_context:",
    // rdi = &mut old_sp, rsi = new_sp
    "push rbp",
    "push rbx",
    "push r12",
    "push r13",
    "push r14",
    "push r15",
    "mov [rdi], rsp",
    "mov rsp, rsi",
    "pop r15",
    "pop r14",
    "pop r13",
    "pop r12",
    "pop rbx",
    "pop rbp",
    "ret",
);

extern "C" {
    fn nexke_switch_context(old_sp: *mut usize, new_sp: usize);
}

/// Switches to the stack at `new_sp`, saving the outgoing context through
/// `old_sp`. Returns when the old context is resumed.
///
/// # Safety
/// Both pointers must reference valid, correctly laid-out kernel stacks,
/// and the caller must hold the run queue locked at IPL high.
pub unsafe fn switch_context(old_sp: *mut usize, new_sp: usize) {
    nexke_switch_context(old_sp, new_sp);
}

/// A thread's kernel stack plus its saved stack pointer.
pub struct ThreadContext {
    #[allow(dead_code)]
    stack: Box<[u8]>,
    pub sp: usize,
}

/// Allocates a kernel stack primed so the first switch "returns" into
/// `entry`. The frame layout must match the pop order in
/// `nexke_switch_context`.
pub fn alloc_context(entry: extern "C" fn()) -> Option<ThreadContext> {
    let stack = vec![0u8; KERNEL_STACK_SIZE].into_boxed_slice();
    // Entry runs as if reached by a call: rsp == 8 (mod 16) at its first
    // instruction
    let top = ((stack.as_ptr() as usize + KERNEL_STACK_SIZE) & !0xF) - 8;
    let sp = top - 7 * 8;
    unsafe {
        let frame = sp as *mut u64;
        frame.add(0).write(0); // r15
        frame.add(1).write(0); // r14
        frame.add(2).write(0); // r13
        frame.add(3).write(0); // r12
        frame.add(4).write(0); // rbx
        frame.add(5).write(0); // rbp
        frame.add(6).write(entry as usize as u64); // return address
    }
    Some(ThreadContext { stack, sp })
}
