// Interrupt core: the per-vector table, hardware-interrupt chains, IPL
// arbitration, and the trap dispatcher. The hardware controller sits
// behind the IntCtrl trait and decides vector assignment; chain policy
// lives here.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};
use spin::Mutex;

use super::{platform, IntCtrlKind};
use crate::arch::{self, TrapFrame};
use crate::ccb::{ccb, Ipl, IPL_HIGH, IPL_TIMER};
use crate::klib::error::{KResult, KernelError};

pub const MAX_INTS: usize = 256;

/// First vector usable for hardware interrupts; everything below is CPU
/// exceptions and service traps.
pub const BASE_HWINT: u32 = 32;

/// GSI value for internally managed interrupts (pre-assigned vectors,
/// no controller programming).
pub const GSI_INTERNAL: u32 = u32::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntType {
    Exception,
    Service,
    HwInt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntMode {
    Edge,
    Level,
}

/// First-level handler. Returns true when the trap was handled.
pub type IntHandler = fn(&Interrupt, &mut TrapFrame) -> bool;

/// One vector's interrupt object.
pub struct Interrupt {
    vector: u32,
    ty: IntType,
    handler: Option<IntHandler>,
    call_count: AtomicU64,
    /// Owning GSI for hardware vectors.
    chain_gsi: Option<u32>,
}

impl Interrupt {
    pub fn vector(&self) -> u32 {
        self.vector
    }

    pub fn int_type(&self) -> IntType {
        self.ty
    }

    pub fn call_count(&self) -> u64 {
        self.call_count.load(Ordering::Relaxed)
    }
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HwIntFlags: u32 {
        /// Line is active low
        const ACTIVE_LOW    = 1 << 0;
        /// Refuses to share a line
        const NON_CHAINABLE = 1 << 1;
        /// Requires its exact IPL; triggers a chain remap when joining
        const FORCE_IPL     = 1 << 2;
        /// Member of a chain of length >= 2
        const CHAINED       = 1 << 3;
        /// Internally managed: vector pre-assigned, no controller setup
        const INTERNAL      = 1 << 4;
    }
}

pub struct HwIntState {
    pub ipl: Ipl,
    pub mode: IntMode,
    pub flags: HwIntFlags,
    pub vector: u32,
}

/// A hardware interrupt record: one handler on one GSI line.
pub struct HwInterrupt {
    pub gsi: u32,
    pub handler: IntHandler,
    state: Mutex<HwIntState>,
}

impl HwInterrupt {
    pub fn new(
        handler: IntHandler,
        gsi: u32,
        ipl: Ipl,
        mode: IntMode,
        flags: HwIntFlags,
    ) -> Arc<HwInterrupt> {
        Arc::new(HwInterrupt {
            gsi,
            handler,
            state: Mutex::new(HwIntState {
                // An IPL of 0 would never mask; bump it
                ipl: if ipl == 0 { 1 } else { ipl },
                mode,
                flags,
                vector: 0,
            }),
        })
    }

    /// An internally managed interrupt with a pre-assigned vector.
    pub fn new_internal(
        handler: IntHandler,
        vector: u32,
        ipl: Ipl,
        mode: IntMode,
        flags: HwIntFlags,
    ) -> Arc<HwInterrupt> {
        Arc::new(HwInterrupt {
            gsi: GSI_INTERNAL,
            handler,
            state: Mutex::new(HwIntState {
                ipl: if ipl == 0 { 1 } else { ipl },
                mode,
                flags: flags | HwIntFlags::INTERNAL,
                vector,
            }),
        })
    }

    pub fn state(&self) -> spin::MutexGuard<'_, HwIntState> {
        self.state.lock()
    }

    pub fn vector(&self) -> u32 {
        self.state.lock().vector
    }

    pub fn ipl(&self) -> Ipl {
        self.state.lock().ipl
    }

    pub fn flags(&self) -> HwIntFlags {
        self.state.lock().flags
    }

    pub fn set_vector(&self, vector: u32) {
        self.state.lock().vector = vector;
    }

    pub fn set_ipl(&self, ipl: Ipl) {
        self.state.lock().ipl = ipl;
    }
}

struct ChainState {
    list: Vec<Arc<HwInterrupt>>,
    no_remap: bool,
}

/// All hardware interrupts sharing one GSI line.
pub struct IntChain {
    state: Mutex<ChainState>,
}

impl IntChain {
    fn new() -> IntChain {
        IntChain {
            state: Mutex::new(ChainState {
                list: Vec::new(),
                no_remap: false,
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The hardware interrupt controller contract. Implemented by the 8259A
/// on PC (APIC and GIC slot in the same way).
pub trait IntCtrl: Send + Sync {
    fn kind(&self) -> IntCtrlKind;
    /// Acknowledge a trap; false means spurious.
    fn begin_interrupt(&self, ctx: &mut TrapFrame) -> bool;
    /// End-of-interrupt.
    fn end_interrupt(&self, ctx: &mut TrapFrame);
    fn enable_interrupt(&self, hw: &HwInterrupt);
    fn disable_interrupt(&self, hw: &HwInterrupt);
    /// Program the hardware priority mask for an IPL.
    fn set_ipl(&self, ipl: Ipl);
    /// Allocate a vector and program the line (masked); may adjust the
    /// record's IPL. None when no vector fits.
    fn connect_interrupt(&self, hw: &HwInterrupt) -> Option<u32>;
    /// Mask the line and release its vector.
    fn disconnect_interrupt(&self, hw: &HwInterrupt);
    /// Resolve the active vector when the trap frame alone can't (some
    /// controllers read it from an acknowledge register).
    fn get_vector(&self, ctx: &mut TrapFrame) -> Option<u32> {
        let _ = ctx;
        None
    }
    fn num_lines(&self) -> u32;
}

static INT_TABLE: Mutex<Vec<Option<Arc<Interrupt>>>> = Mutex::new(Vec::new());
static CHAINS: Mutex<Vec<Arc<IntChain>>> = Mutex::new(Vec::new());
// Internally managed interrupts have no line; their chains key on the
// pre-assigned vector so records with different vectors never share one.
static INTERNAL_CHAINS: Mutex<alloc::collections::BTreeMap<u32, Arc<IntChain>>> =
    Mutex::new(alloc::collections::BTreeMap::new());

fn with_table<R>(f: impl FnOnce(&mut Vec<Option<Arc<Interrupt>>>) -> R) -> R {
    let mut table = INT_TABLE.lock();
    if table.is_empty() {
        table.resize_with(MAX_INTS, || None);
    }
    f(&mut table)
}

/// Sizes the per-GSI chain map once the controller is chosen.
pub fn init_chains(num_lines: u32) {
    let mut chains = CHAINS.lock();
    while chains.len() < num_lines as usize {
        chains.push(Arc::new(IntChain::new()));
    }
}

/// The chain for an internally managed vector.
pub fn internal_chain_for(vector: u32) -> Arc<IntChain> {
    INTERNAL_CHAINS
        .lock()
        .entry(vector)
        .or_insert_with(|| Arc::new(IntChain::new()))
        .clone()
}

/// The chain for a GSI line.
pub fn chain_for(gsi: u32) -> Arc<IntChain> {
    assert!(gsi != GSI_INTERNAL, "internal chains key on the vector");
    CHAINS.lock()[gsi as usize].clone()
}

/// The chain a hardware-interrupt record belongs to.
fn chain_of(hw: &HwInterrupt) -> Arc<IntChain> {
    if hw.gsi == GSI_INTERNAL {
        internal_chain_for(hw.vector())
    } else {
        chain_for(hw.gsi)
    }
}

fn alloc_interrupt(vector: u32, ty: IntType, handler: Option<IntHandler>, gsi: Option<u32>) -> KResult<Arc<Interrupt>> {
    assert!((vector as usize) < MAX_INTS);
    with_table(|table| {
        if table[vector as usize].is_some() {
            return Err(KernelError::Busy);
        }
        let obj = Arc::new(Interrupt {
            vector,
            ty,
            handler,
            call_count: AtomicU64::new(0),
            chain_gsi: gsi,
        });
        table[vector as usize] = Some(obj.clone());
        Ok(obj)
    })
}

/// Fetches the interrupt object for a vector.
pub fn get_interrupt(vector: u32) -> Option<Arc<Interrupt>> {
    if vector as usize >= MAX_INTS {
        return None;
    }
    with_table(|table| table[vector as usize].clone())
}

/// Installs an exception handler. Exception vectors live below the
/// hardware window.
pub fn install_exec(vector: u32, handler: IntHandler) -> KResult<Arc<Interrupt>> {
    if vector > BASE_HWINT {
        return Err(KernelError::InvalidArgument);
    }
    arch::disable();
    let res = alloc_interrupt(vector, IntType::Exception, Some(handler), None);
    arch::enable();
    res
}

/// Installs a service-trap handler.
pub fn install_svc(vector: u32, handler: IntHandler) -> KResult<Arc<Interrupt>> {
    if vector > BASE_HWINT {
        return Err(KernelError::InvalidArgument);
    }
    arch::disable();
    let res = alloc_interrupt(vector, IntType::Service, Some(handler), None);
    arch::enable();
    res
}

fn uninstall_locked(obj: &Arc<Interrupt>) {
    with_table(|table| {
        if table[obj.vector as usize].is_none() {
            panic!("can't uninstall non-existent interrupt");
        }
        table[obj.vector as usize] = None;
    });
}

/// Removes a vector's interrupt object.
pub fn uninstall_interrupt(obj: &Arc<Interrupt>) {
    arch::disable();
    uninstall_locked(obj);
    arch::enable();
}

/// Two records may share a line iff both are chainable, level triggered,
/// and agree on mode and polarity.
pub fn ints_compatible(a: &HwIntState, b: &HwIntState) -> bool {
    if a.mode != b.mode {
        return false;
    }
    if (a.flags ^ b.flags).contains(HwIntFlags::ACTIVE_LOW) {
        return false;
    }
    true
}

/// Retargets every record of a chain to a new vector and IPL. Called with
/// the chain locked and interrupts disabled.
fn remap_interrupt(
    old: &Arc<Interrupt>,
    new_vector: u32,
    new_ipl: Ipl,
    chain: &mut ChainState,
) -> KResult<Arc<Interrupt>> {
    assert!((new_vector as usize) < MAX_INTS);
    assert_eq!(old.ty, IntType::HwInt);
    let new_obj = if old.vector != new_vector {
        let obj = alloc_interrupt(new_vector, IntType::HwInt, None, old.chain_gsi)?;
        uninstall_locked(old);
        obj
    } else {
        old.clone()
    };
    for hw in chain.list.iter() {
        let mut st = hw.state.lock();
        st.vector = new_vector;
        st.ipl = new_ipl;
    }
    Ok(new_obj)
}

/// Connects a hardware interrupt to its line, chaining onto an existing
/// compatible chain or starting a new one.
pub fn connect_interrupt(hw: &Arc<HwInterrupt>) -> KResult<Arc<Interrupt>> {
    let (ipl, flags, mode) = {
        let st = hw.state.lock();
        (st.ipl, st.flags, st.mode)
    };
    if ipl > IPL_TIMER {
        return Err(KernelError::InvalidArgument);
    }
    arch::disable();
    let chain = chain_of(hw);
    let mut cs = chain.state.lock();
    let result = (|| {
        if let Some(head) = cs.list.first().cloned() {
            let (head_ipl, head_vector, head_flags_ok) = {
                let head_st = head.state.lock();
                let compat = !flags.contains(HwIntFlags::NON_CHAINABLE)
                    && !head_st.flags.contains(HwIntFlags::NON_CHAINABLE)
                    && ints_compatible(&head_st, &*hw.state.lock())
                    && mode != IntMode::Edge;
                (head_st.ipl, head_st.vector, compat)
            };
            if !head_flags_ok {
                return Err(KernelError::Busy);
            }
            let obj = if flags.contains(HwIntFlags::FORCE_IPL) && ipl != head_ipl {
                if cs.no_remap {
                    return Err(KernelError::Busy);
                }
                // Allocate a fresh vector at the requested IPL and move
                // the whole chain over
                let vector = platform()
                    .int_ctrl()
                    .connect_interrupt(hw)
                    .ok_or(KernelError::Busy)?;
                hw.set_vector(vector);
                let old_obj = get_interrupt(head_vector).ok_or(KernelError::NotFound)?;
                remap_interrupt(&old_obj, vector, hw.ipl(), &mut cs)?
            } else {
                let mut st = hw.state.lock();
                st.ipl = head_ipl;
                st.vector = head_vector;
                drop(st);
                get_interrupt(head_vector).ok_or(KernelError::NotFound)?
            };
            cs.list.insert(0, hw.clone());
            hw.state.lock().flags.insert(HwIntFlags::CHAINED);
            if cs.list.len() == 2 {
                cs.list[1].state.lock().flags.insert(HwIntFlags::CHAINED);
            }
            Ok(obj)
        } else {
            let vector = if flags.contains(HwIntFlags::INTERNAL) {
                hw.vector()
            } else {
                let v = platform()
                    .int_ctrl()
                    .connect_interrupt(hw)
                    .ok_or(KernelError::Busy)?;
                hw.set_vector(v);
                v
            };
            let obj = alloc_interrupt(vector, IntType::HwInt, None, Some(hw.gsi))?;
            cs.list.insert(0, hw.clone());
            if !flags.contains(HwIntFlags::INTERNAL) {
                platform().int_ctrl().enable_interrupt(hw);
            }
            Ok(obj)
        }
    })();
    if result.is_ok() && flags.contains(HwIntFlags::FORCE_IPL) {
        cs.no_remap = true;
    }
    drop(cs);
    arch::enable();
    result
}

/// Disconnects a record; an emptied chain masks the line and frees the
/// vector.
pub fn disconnect_interrupt(hw: &Arc<HwInterrupt>) {
    arch::disable();
    let chain = chain_of(hw);
    let mut cs = chain.state.lock();
    cs.list.retain(|h| !Arc::ptr_eq(h, hw));
    hw.state.lock().flags.remove(HwIntFlags::CHAINED);
    if cs.list.len() == 1 {
        cs.list[0].state.lock().flags.remove(HwIntFlags::CHAINED);
    }
    if cs.list.is_empty() {
        if !hw.flags().contains(HwIntFlags::INTERNAL) {
            platform().int_ctrl().disconnect_interrupt(hw);
        }
        if let Some(obj) = get_interrupt(hw.vector()) {
            uninstall_locked(&obj);
        }
    }
    drop(cs);
    arch::enable();
}

/// Unmasks a line.
pub fn enable_interrupt(hw: &Arc<HwInterrupt>) {
    arch::disable();
    platform().int_ctrl().enable_interrupt(hw);
    arch::enable();
}

/// Masks a line.
pub fn disable_interrupt(hw: &Arc<HwInterrupt>) {
    arch::disable();
    platform().int_ctrl().disable_interrupt(hw);
    arch::enable();
}

/// Raises the IPL; lowering through raise is fatal. Returns the previous
/// level for the matching `lower_ipl`.
pub fn raise_ipl(new: Ipl) -> Ipl {
    arch::disable();
    let ccb = ccb();
    let old = ccb.cur_ipl.load(Ordering::SeqCst);
    if old > new {
        panic!("invalid IPL raise: {} -> {}", old, new);
    }
    ccb.cur_ipl.store(new, Ordering::SeqCst);
    if new != IPL_HIGH {
        if let Some(ctrl) = platform().int_ctrl_opt() {
            ctrl.set_ipl(new);
        }
        arch::enable();
    }
    old
}

/// Lowers the IPL to a level previously returned by `raise_ipl`.
pub fn lower_ipl(old: Ipl) {
    arch::disable();
    let ccb = ccb();
    if ccb.cur_ipl.load(Ordering::SeqCst) < old {
        panic!("invalid IPL lower");
    }
    ccb.cur_ipl.store(old, Ordering::SeqCst);
    if old != IPL_HIGH {
        if let Some(ctrl) = platform().int_ctrl_opt() {
            ctrl.set_ipl(old);
        }
        arch::enable();
    }
}

/// Crash path for unhandled traps.
pub fn bad_trap(ctx: &TrapFrame, msg: &str) -> ! {
    crate::printk!(
        crate::klib::printk::LogLevel::Emergency,
        "bad trap: {}",
        msg
    );
    dump_frame(ctx);
    arch::crash();
}

#[cfg(all(target_arch = "x86_64", not(test)))]
fn dump_frame(ctx: &TrapFrame) {
    ctx.dump();
}

#[cfg(any(not(target_arch = "x86_64"), test))]
fn dump_frame(ctx: &TrapFrame) {
    crate::error!("{:?}", ctx);
}

/// Default processing when a first-level exception handler declines: the
/// system crashes with the exception name and a register dump.
fn exec_dispatch(obj: &Interrupt, ctx: &mut TrapFrame) -> ! {
    bad_trap(ctx, exception_name(obj.vector));
}

fn exception_name(vector: u32) -> &'static str {
    const NAMES: [&str; 32] = [
        "divide error",
        "debug",
        "NMI",
        "breakpoint",
        "overflow",
        "bound range exceeded",
        "invalid opcode",
        "device not available",
        "double fault",
        "coprocessor overrun",
        "invalid TSS",
        "segment not present",
        "stack fault",
        "general protection fault",
        "page fault",
        "reserved",
        "x87 FP exception",
        "alignment check",
        "machine check",
        "SIMD FP exception",
        "virtualization exception",
        "control protection exception",
        "reserved",
        "reserved",
        "reserved",
        "reserved",
        "reserved",
        "reserved",
        "hypervisor injection",
        "VMM communication",
        "security exception",
        "reserved",
    ];
    NAMES
        .get(vector as usize)
        .copied()
        .unwrap_or("unknown exception")
}

/// The trap dispatcher. Every exception, service trap, and hardware
/// interrupt funnels through here from the architecture entry stubs.
pub fn trap_dispatch(ctx: &mut TrapFrame) {
    let ccb = ccb();
    ccb.int_count.fetch_add(1, Ordering::Relaxed);
    let vector = ctx.int_num();
    let obj = match get_interrupt(vector) {
        Some(obj) => obj,
        None => bad_trap(ctx, "unhandled interrupt"),
    };
    obj.call_count.fetch_add(1, Ordering::Relaxed);
    match obj.ty {
        IntType::Exception => {
            let resolved = match obj.handler {
                Some(h) => h(&obj, ctx),
                None => false,
            };
            if !resolved {
                exec_dispatch(&obj, ctx);
            }
        }
        IntType::Service => {
            if let Some(h) = obj.handler {
                h(&obj, ctx);
            }
        }
        IntType::HwInt => {
            let preempt_set = ccb.preempt_disable.load(Ordering::SeqCst) > 0;
            if !preempt_set {
                crate::task::sched::disable_preempt();
            }
            ccb.int_active.store(true, Ordering::SeqCst);
            let ctrl = platform().int_ctrl();
            if !ctrl.begin_interrupt(ctx) {
                ccb.spurious_ints.fetch_add(1, Ordering::Relaxed);
            } else {
                // Internal vectors have no line; their chain keys on the
                // trapping vector itself
                let chain = match obj.chain_gsi {
                    Some(gsi) if gsi != GSI_INTERNAL => chain_for(gsi),
                    _ => internal_chain_for(vector),
                };
                // Snapshot under the chain lock; handlers run with the
                // chain unlocked and interrupts enabled at the chain IPL
                let records: Vec<Arc<HwInterrupt>> = chain.state.lock().list.clone();
                if let Some(first) = records.first() {
                    let old_ipl = ccb.cur_ipl.swap(first.ipl(), Ordering::SeqCst);
                    for hw in records.iter() {
                        arch::enable();
                        let handled = (hw.handler)(&obj, ctx);
                        arch::disable();
                        if handled {
                            break;
                        }
                    }
                    ccb.cur_ipl.store(old_ipl, Ordering::SeqCst);
                }
                ctrl.end_interrupt(ctx);
            }
            ccb.int_active.store(false, Ordering::SeqCst);
            if !preempt_set {
                crate::task::sched::enable_preempt();
            }
        }
    }
}

#[cfg(test)]
pub mod testing {
    //! A software interrupt controller for hosted tests.

    use super::*;
    use core::sync::atomic::AtomicU32;

    pub struct MockCtrl {
        pub last_ipl: AtomicU32,
        pub next_vector: AtomicU32,
        pub enables: AtomicU32,
        pub disables: AtomicU32,
        pub spurious: core::sync::atomic::AtomicBool,
    }

    impl IntCtrl for MockCtrl {
        fn kind(&self) -> IntCtrlKind {
            IntCtrlKind::I8259A
        }
        fn begin_interrupt(&self, _ctx: &mut TrapFrame) -> bool {
            !self.spurious.load(Ordering::SeqCst)
        }
        fn end_interrupt(&self, _ctx: &mut TrapFrame) {}
        fn enable_interrupt(&self, _hw: &HwInterrupt) {
            self.enables.fetch_add(1, Ordering::SeqCst);
        }
        fn disable_interrupt(&self, _hw: &HwInterrupt) {
            self.disables.fetch_add(1, Ordering::SeqCst);
        }
        fn set_ipl(&self, ipl: Ipl) {
            self.last_ipl.store(ipl as u32, Ordering::SeqCst);
        }
        fn connect_interrupt(&self, _hw: &HwInterrupt) -> Option<u32> {
            Some(self.next_vector.fetch_add(1, Ordering::SeqCst))
        }
        fn disconnect_interrupt(&self, hw: &HwInterrupt) {
            self.disable_interrupt(hw);
        }
        fn num_lines(&self) -> u32 {
            24
        }
    }

    pub static MOCK_CTRL: MockCtrl = MockCtrl {
        last_ipl: AtomicU32::new(0),
        next_vector: AtomicU32::new(64),
        enables: AtomicU32::new(0),
        disables: AtomicU32::new(0),
        spurious: core::sync::atomic::AtomicBool::new(false),
    };

    /// Installs the mock controller (idempotent).
    pub fn install_mock_ctrl() -> &'static MockCtrl {
        platform().set_int_ctrl(&MOCK_CTRL);
        &MOCK_CTRL
    }
}

#[cfg(test)]
mod tests {
    use super::testing::install_mock_ctrl;
    use super::*;

    fn nop_handler(_obj: &Interrupt, _ctx: &mut TrapFrame) -> bool {
        true
    }

    fn decline_handler(_obj: &Interrupt, _ctx: &mut TrapFrame) -> bool {
        false
    }

    #[test]
    fn test_install_exec_and_duplicate() {
        install_mock_ctrl();
        let obj = install_exec(3, nop_handler).unwrap();
        assert_eq!(obj.vector(), 3);
        assert!(install_exec(3, nop_handler).is_err());
        assert!(install_exec(200, nop_handler).is_err());
        uninstall_interrupt(&obj);
        assert!(get_interrupt(3).is_none());
    }

    #[test]
    fn test_chain_grows_and_marks_chained() {
        install_mock_ctrl();
        // S4: two compatible level-low records on GSI 11 share a vector
        let a = HwInterrupt::new(
            nop_handler,
            11,
            8,
            IntMode::Level,
            HwIntFlags::ACTIVE_LOW,
        );
        let b = HwInterrupt::new(
            decline_handler,
            11,
            8,
            IntMode::Level,
            HwIntFlags::ACTIVE_LOW,
        );
        let obj_a = connect_interrupt(&a).unwrap();
        let va = a.vector();
        let obj_b = connect_interrupt(&b).unwrap();
        assert_eq!(b.vector(), va);
        assert!(Arc::ptr_eq(&obj_a, &obj_b));
        let chain = chain_for(11);
        assert_eq!(chain.len(), 2);
        assert!(a.flags().contains(HwIntFlags::CHAINED));
        assert!(b.flags().contains(HwIntFlags::CHAINED));
        // A non-chainable third record is refused
        let c = HwInterrupt::new(
            nop_handler,
            11,
            8,
            IntMode::Level,
            HwIntFlags::ACTIVE_LOW | HwIntFlags::NON_CHAINABLE,
        );
        assert!(matches!(connect_interrupt(&c), Err(KernelError::Busy)));
        disconnect_interrupt(&b);
        assert_eq!(chain.len(), 1);
        assert!(!a.flags().contains(HwIntFlags::CHAINED));
        disconnect_interrupt(&a);
        assert!(chain.is_empty());
        assert!(get_interrupt(va).is_none());
    }

    #[test]
    fn test_incompatible_polarity_and_edge_rejected() {
        install_mock_ctrl();
        let a = HwInterrupt::new(
            nop_handler,
            12,
            8,
            IntMode::Level,
            HwIntFlags::ACTIVE_LOW,
        );
        connect_interrupt(&a).unwrap();
        // Polarity mismatch
        let b = HwInterrupt::new(nop_handler, 12, 8, IntMode::Level, HwIntFlags::empty());
        assert!(connect_interrupt(&b).is_err());
        // Edge is never chainable
        let c = HwInterrupt::new(
            nop_handler,
            12,
            8,
            IntMode::Edge,
            HwIntFlags::ACTIVE_LOW,
        );
        assert!(connect_interrupt(&c).is_err());
        disconnect_interrupt(&a);
    }

    #[test]
    fn test_force_ipl_remaps_chain() {
        install_mock_ctrl();
        let a = HwInterrupt::new(
            nop_handler,
            13,
            8,
            IntMode::Level,
            HwIntFlags::empty(),
        );
        connect_interrupt(&a).unwrap();
        let old_vector = a.vector();
        let b = HwInterrupt::new(
            nop_handler,
            13,
            12,
            IntMode::Level,
            HwIntFlags::FORCE_IPL,
        );
        let obj = connect_interrupt(&b).unwrap();
        // Whole chain retargeted to b's vector and IPL
        assert_ne!(a.vector(), old_vector);
        assert_eq!(a.vector(), b.vector());
        assert_eq!(a.ipl(), 12);
        assert_eq!(obj.vector(), b.vector());
        assert!(get_interrupt(old_vector).is_none());
        // The chain is now pinned; another FORCE_IPL at a different IPL
        // is refused
        let c = HwInterrupt::new(
            nop_handler,
            13,
            5,
            IntMode::Level,
            HwIntFlags::FORCE_IPL,
        );
        assert!(connect_interrupt(&c).is_err());
        disconnect_interrupt(&b);
        disconnect_interrupt(&a);
    }

    #[test]
    fn test_ipl_raise_lower() {
        let _guard = crate::ccb::testing::lock();
        install_mock_ctrl();
        let ccb = ccb();
        let base = ccb.cur_ipl();
        let old = raise_ipl(IPL_HIGH);
        assert_eq!(old, base);
        assert_eq!(ccb.cur_ipl(), IPL_HIGH);
        lower_ipl(old);
        assert_eq!(ccb.cur_ipl(), base);
    }

    #[test]
    fn test_service_dispatch_counts_calls() {
        let _guard = crate::ccb::testing::lock();
        install_mock_ctrl();
        static FIRED: AtomicU64 = AtomicU64::new(0);
        fn svc(_obj: &Interrupt, _ctx: &mut TrapFrame) -> bool {
            FIRED.fetch_add(1, Ordering::SeqCst);
            true
        }
        let obj = install_svc(30, svc).unwrap();
        let mut frame = TrapFrame {
            int_no: 30,
            err_code: 0,
        };
        trap_dispatch(&mut frame);
        trap_dispatch(&mut frame);
        assert_eq!(FIRED.load(Ordering::SeqCst), 2);
        assert_eq!(obj.call_count(), 2);
        uninstall_interrupt(&obj);
    }

    #[test]
    fn test_hwint_dispatch_runs_chain_in_order() {
        let _guard = crate::ccb::testing::lock();
        install_mock_ctrl();
        static ORDER: Mutex<Vec<u32>> = Mutex::new(Vec::new());
        fn first(_obj: &Interrupt, _ctx: &mut TrapFrame) -> bool {
            ORDER.lock().push(1);
            false // not ours; the next record gets a shot
        }
        fn second(_obj: &Interrupt, _ctx: &mut TrapFrame) -> bool {
            ORDER.lock().push(2);
            true
        }
        let a = HwInterrupt::new(second, 14, 9, IntMode::Level, HwIntFlags::empty());
        let b = HwInterrupt::new(first, 14, 9, IntMode::Level, HwIntFlags::empty());
        connect_interrupt(&a).unwrap();
        connect_interrupt(&b).unwrap();
        let vector = a.vector();
        let mut frame = TrapFrame {
            int_no: vector as u64,
            err_code: 0,
        };
        trap_dispatch(&mut frame);
        // b chained at the head, a ran after it declined
        assert_eq!(*ORDER.lock(), alloc::vec![1, 2]);
        disconnect_interrupt(&b);
        disconnect_interrupt(&a);
    }

    #[test]
    fn test_internal_vectors_keep_separate_chains() {
        let _guard = crate::ccb::testing::lock();
        install_mock_ctrl();
        static A_RUNS: AtomicU64 = AtomicU64::new(0);
        static B_RUNS: AtomicU64 = AtomicU64::new(0);
        fn handler_a(_obj: &Interrupt, _ctx: &mut TrapFrame) -> bool {
            A_RUNS.fetch_add(1, Ordering::SeqCst);
            true
        }
        fn handler_b(_obj: &Interrupt, _ctx: &mut TrapFrame) -> bool {
            B_RUNS.fetch_add(1, Ordering::SeqCst);
            true
        }
        let a = HwInterrupt::new_internal(handler_a, 180, 7, IntMode::Level, HwIntFlags::empty());
        let b = HwInterrupt::new_internal(handler_b, 181, 9, IntMode::Level, HwIntFlags::empty());
        let obj_a = connect_interrupt(&a).unwrap();
        let obj_b = connect_interrupt(&b).unwrap();
        // Each pre-assigned vector owns its own chain of one record
        assert!(!Arc::ptr_eq(&obj_a, &obj_b));
        assert_eq!(internal_chain_for(180).len(), 1);
        assert_eq!(internal_chain_for(181).len(), 1);
        assert!(!a.flags().contains(HwIntFlags::CHAINED));
        // A trap on one vector runs only that vector's handler, at its
        // own IPL
        let mut frame = TrapFrame {
            int_no: 180,
            err_code: 0,
        };
        trap_dispatch(&mut frame);
        assert_eq!(A_RUNS.load(Ordering::SeqCst), 1);
        assert_eq!(B_RUNS.load(Ordering::SeqCst), 0);
        let mut frame = TrapFrame {
            int_no: 181,
            err_code: 0,
        };
        trap_dispatch(&mut frame);
        assert_eq!(A_RUNS.load(Ordering::SeqCst), 1);
        assert_eq!(B_RUNS.load(Ordering::SeqCst), 1);
        disconnect_interrupt(&a);
        disconnect_interrupt(&b);
        assert!(internal_chain_for(180).is_empty());
        assert!(get_interrupt(180).is_none());
        assert!(get_interrupt(181).is_none());
    }

    #[test]
    fn test_internal_same_vector_chains() {
        let _guard = crate::ccb::testing::lock();
        install_mock_ctrl();
        let a = HwInterrupt::new_internal(
            decline_handler,
            182,
            8,
            IntMode::Level,
            HwIntFlags::empty(),
        );
        let b =
            HwInterrupt::new_internal(nop_handler, 182, 8, IntMode::Level, HwIntFlags::empty());
        let obj_a = connect_interrupt(&a).unwrap();
        let obj_b = connect_interrupt(&b).unwrap();
        assert!(Arc::ptr_eq(&obj_a, &obj_b));
        let chain = internal_chain_for(182);
        assert_eq!(chain.len(), 2);
        assert!(a.flags().contains(HwIntFlags::CHAINED));
        assert!(b.flags().contains(HwIntFlags::CHAINED));
        disconnect_interrupt(&b);
        assert_eq!(chain.len(), 1);
        assert!(!a.flags().contains(HwIntFlags::CHAINED));
        disconnect_interrupt(&a);
        assert!(chain.is_empty());
        assert!(get_interrupt(182).is_none());
    }

    #[test]
    fn test_spurious_counted_silently() {
        let _guard = crate::ccb::testing::lock();
        let ctrl = install_mock_ctrl();
        let a = HwInterrupt::new(nop_handler, 15, 9, IntMode::Level, HwIntFlags::empty());
        connect_interrupt(&a).unwrap();
        let before = ccb().spurious_ints.load(Ordering::SeqCst);
        ctrl.spurious.store(true, Ordering::SeqCst);
        let mut frame = TrapFrame {
            int_no: a.vector() as u64,
            err_code: 0,
        };
        trap_dispatch(&mut frame);
        ctrl.spurious.store(false, Ordering::SeqCst);
        assert_eq!(ccb().spurious_ints.load(Ordering::SeqCst), before + 1);
        disconnect_interrupt(&a);
    }
}
