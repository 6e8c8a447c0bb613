// Kernel support library: logging, errors, panic plumbing, boot info,
// argument parsing, resource ID arenas.

pub mod args;
pub mod bootinfo;
pub mod error;
pub mod panic;
pub mod printk;
pub mod resource;
pub mod ringbuf;
