// Trap frame pushed by the interrupt entry stubs.

/// Register state at trap entry. Layout must match the push order in the
/// entry stubs in `idt.rs`.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct TrapFrame {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rbp: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rbx: u64,
    pub rax: u64,
    pub int_no: u64,
    pub err_code: u64,
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

impl TrapFrame {
    pub fn int_num(&self) -> u32 {
        // The stubs push the vector as an immediate; vectors >= 128
        // arrive sign extended
        (self.int_no & 0xFF) as u32
    }

    /// Logs a register dump for a bad trap.
    pub fn dump(&self) {
        crate::error!(
            "rip={:#018x} cs={:#06x} rflags={:#010x} rsp={:#018x} ss={:#06x}",
            self.rip,
            self.cs,
            self.rflags,
            self.rsp,
            self.ss
        );
        crate::error!(
            "rax={:#018x} rbx={:#018x} rcx={:#018x} rdx={:#018x}",
            self.rax,
            self.rbx,
            self.rcx,
            self.rdx
        );
        crate::error!(
            "rsi={:#018x} rdi={:#018x} rbp={:#018x} err={:#x}",
            self.rsi,
            self.rdi,
            self.rbp,
            self.err_code
        );
        crate::error!(
            "r8 ={:#018x} r9 ={:#018x} r10={:#018x} r11={:#018x}",
            self.r8,
            self.r9,
            self.r10,
            self.r11
        );
        crate::error!(
            "r12={:#018x} r13={:#018x} r14={:#018x} r15={:#018x}",
            self.r12,
            self.r13,
            self.r14,
            self.r15
        );
    }
}
