// x86_64 architecture backend.

pub mod context;
pub mod cpu;
pub mod idt;
pub mod mul;
pub mod serial;
pub mod trapframe;

pub use context::{alloc_context, switch_context, ThreadContext};
pub use cpu::{crash, disable, enable, halt, hold_ints, unhold_ints};
pub use trapframe::TrapFrame;

/// Base vector for hardware interrupts; 0..31 are CPU exceptions.
pub const BASE_HWINT: u32 = 32;
