// Architecture selection. The bare-metal x86_64 backend is used for real
// builds; the hosted backend provides the same surface for unit tests and
// non-x86 hosts.

#[cfg(all(target_arch = "x86_64", not(test)))]
pub mod x86_64;
#[cfg(all(target_arch = "x86_64", not(test)))]
pub use x86_64::{
    alloc_context, crash, disable, enable, halt, hold_ints, switch_context, unhold_ints,
    ThreadContext, TrapFrame,
};

#[cfg(any(not(target_arch = "x86_64"), test))]
pub mod hosted;
#[cfg(any(not(target_arch = "x86_64"), test))]
pub use hosted::{
    alloc_context, crash, disable, enable, halt, hold_ints, switch_context, unhold_ints,
    ThreadContext, TrapFrame,
};

/// Scans a ready bitmap for the highest priority (lowest set bit index).
#[inline]
pub fn scan_priority(mask: u64) -> Option<u32> {
    if mask == 0 {
        None
    } else {
        Some(mask.trailing_zeros())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scan_priority() {
        assert_eq!(scan_priority(0), None);
        assert_eq!(scan_priority(1), Some(0));
        assert_eq!(scan_priority(0b1010_0000), Some(5));
        assert_eq!(scan_priority(1 << 63), Some(63));
    }
}
