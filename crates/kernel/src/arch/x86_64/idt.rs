// Interrupt descriptor table and trap entry stubs. Every vector funnels
// through a common stub that builds a `TrapFrame` and calls the platform
// trap dispatcher.

use super::trapframe::TrapFrame;

// Common entry: save the remaining registers (the stub already pushed the
// vector and an error code), hand the frame to Rust, restore, and return.
core::arch::global_asm!(
    ".global nexke_trap_common",
    "nexke_trap_common:",
    "push rax",
    "push rbx",
    "push rcx",
    "push rdx",
    "push rsi",
    "push rdi",
    "push rbp",
    "push r8",
    "push r9",
    "push r10",
    "push r11",
    "push r12",
    "push r13",
    "push r14",
    "push r15",
    "mov rdi, rsp",
    "cld",
    "call nexke_trap_dispatch",
    "pop r15",
    "pop r14",
    "pop r13",
    "pop r12",
    "pop r11",
    "pop r10",
    "pop r9",
    "pop r8",
    "pop rbp",
    "pop rdi",
    "pop rsi",
    "pop rdx",
    "pop rcx",
    "pop rbx",
    "pop rax",
    "add rsp, 16",
    "iretq",
);

#[no_mangle]
extern "C" fn nexke_trap_dispatch(frame: &mut TrapFrame) {
    crate::platform::interrupt::trap_dispatch(frame);
}

// Per-vector stubs. Vectors 8, 10-14, 17, 21, 29 and 30 get an error code
// from the CPU; the rest push a zero placeholder to keep the frame layout
// uniform.
macro_rules! trap_stub_err {
    ($($n:literal),* $(,)?) => {
        $(
            core::arch::global_asm!(concat!(
                ".global nexke_trap_stub_", stringify!($n), "\n",
                "nexke_trap_stub_", stringify!($n), ":\n",
                "push ", stringify!($n), "\n",
                "jmp nexke_trap_common\n",
            ));
        )*
    };
}

macro_rules! trap_stub {
    ($($n:literal),* $(,)?) => {
        $(
            core::arch::global_asm!(concat!(
                ".global nexke_trap_stub_", stringify!($n), "\n",
                "nexke_trap_stub_", stringify!($n), ":\n",
                "push 0\n",
                "push ", stringify!($n), "\n",
                "jmp nexke_trap_common\n",
            ));
        )*
    };
}

trap_stub_err!(8, 10, 11, 12, 13, 14, 17, 21, 29, 30);
trap_stub!(0, 1, 2, 3, 4, 5, 6, 7, 9, 15, 16, 18, 19, 20, 22, 23, 24, 25, 26, 27, 28, 31);
trap_stub!(
    32, 33, 34, 35, 36, 37, 38, 39, 40, 41, 42, 43, 44, 45, 46, 47, 48, 49, 50, 51, 52, 53, 54,
    55, 56, 57, 58, 59, 60, 61, 62, 63
);
trap_stub!(
    64, 65, 66, 67, 68, 69, 70, 71, 72, 73, 74, 75, 76, 77, 78, 79, 80, 81, 82, 83, 84, 85, 86,
    87, 88, 89, 90, 91, 92, 93, 94, 95
);
trap_stub!(
    96, 97, 98, 99, 100, 101, 102, 103, 104, 105, 106, 107, 108, 109, 110, 111, 112, 113, 114,
    115, 116, 117, 118, 119, 120, 121, 122, 123, 124, 125, 126, 127
);
trap_stub!(
    128, 129, 130, 131, 132, 133, 134, 135, 136, 137, 138, 139, 140, 141, 142, 143, 144, 145,
    146, 147, 148, 149, 150, 151, 152, 153, 154, 155, 156, 157, 158, 159
);
trap_stub!(
    160, 161, 162, 163, 164, 165, 166, 167, 168, 169, 170, 171, 172, 173, 174, 175, 176, 177,
    178, 179, 180, 181, 182, 183, 184, 185, 186, 187, 188, 189, 190, 191
);
trap_stub!(
    192, 193, 194, 195, 196, 197, 198, 199, 200, 201, 202, 203, 204, 205, 206, 207, 208, 209,
    210, 211, 212, 213, 214, 215, 216, 217, 218, 219, 220, 221, 222, 223
);
trap_stub!(
    224, 225, 226, 227, 228, 229, 230, 231, 232, 233, 234, 235, 236, 237, 238, 239, 240, 241,
    242, 243, 244, 245, 246, 247, 248, 249, 250, 251, 252, 253, 254, 255
);

// Resolves the address of every stub into one table. Each block scopes a
// private extern declaration bound to the stub symbol by link name.
macro_rules! stub_table {
    ($($n:literal),* $(,)?) => {
        [
            $(
                {
                    extern "C" {
                        #[link_name = concat!("nexke_trap_stub_", stringify!($n))]
                        fn stub();
                    }
                    stub as usize as u64
                }
            ),*
        ]
    };
}

fn stub_addrs() -> [u64; 256] {
    stub_table!(
        0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20, 21, 22, 23, 24,
        25, 26, 27, 28, 29, 30, 31, 32, 33, 34, 35, 36, 37, 38, 39, 40, 41, 42, 43, 44, 45, 46,
        47, 48, 49, 50, 51, 52, 53, 54, 55, 56, 57, 58, 59, 60, 61, 62, 63, 64, 65, 66, 67, 68,
        69, 70, 71, 72, 73, 74, 75, 76, 77, 78, 79, 80, 81, 82, 83, 84, 85, 86, 87, 88, 89, 90,
        91, 92, 93, 94, 95, 96, 97, 98, 99, 100, 101, 102, 103, 104, 105, 106, 107, 108, 109,
        110, 111, 112, 113, 114, 115, 116, 117, 118, 119, 120, 121, 122, 123, 124, 125, 126, 127,
        128, 129, 130, 131, 132, 133, 134, 135, 136, 137, 138, 139, 140, 141, 142, 143, 144, 145,
        146, 147, 148, 149, 150, 151, 152, 153, 154, 155, 156, 157, 158, 159, 160, 161, 162, 163,
        164, 165, 166, 167, 168, 169, 170, 171, 172, 173, 174, 175, 176, 177, 178, 179, 180, 181,
        182, 183, 184, 185, 186, 187, 188, 189, 190, 191, 192, 193, 194, 195, 196, 197, 198, 199,
        200, 201, 202, 203, 204, 205, 206, 207, 208, 209, 210, 211, 212, 213, 214, 215, 216, 217,
        218, 219, 220, 221, 222, 223, 224, 225, 226, 227, 228, 229, 230, 231, 232, 233, 234, 235,
        236, 237, 238, 239, 240, 241, 242, 243, 244, 245, 246, 247, 248, 249, 250, 251, 252, 253,
        254, 255
    )
}

/// One IDT gate.
#[repr(C, packed)]
#[derive(Clone, Copy)]
struct IdtEntry {
    base_low: u16,
    seg: u16,
    ist: u8,
    flags: u8,
    base_mid: u16,
    base_high: u32,
    rsvd: u32,
}

impl IdtEntry {
    const fn empty() -> Self {
        Self {
            base_low: 0,
            seg: 0,
            ist: 0,
            flags: 0,
            base_mid: 0,
            base_high: 0,
            rsvd: 0,
        }
    }

    fn set(&mut self, handler: u64, seg: u16) {
        self.base_low = handler as u16;
        self.base_mid = (handler >> 16) as u16;
        self.base_high = (handler >> 32) as u32;
        self.seg = seg;
        self.ist = 0;
        // Present, DPL 0, 64-bit interrupt gate
        self.flags = 0x8E;
        self.rsvd = 0;
    }
}

static mut IDT: [IdtEntry; 256] = [IdtEntry::empty(); 256];

/// Loads the IDT with the trap stubs. Called once before interrupts are
/// released.
pub fn init() {
    use x86_64::instructions::segmentation::{Segment, CS};
    use x86_64::instructions::tables::lidt;
    use x86_64::structures::DescriptorTablePointer;
    use x86_64::VirtAddr;

    let table = stub_addrs();
    let seg = CS::get_reg().0;
    unsafe {
        for (i, ent) in IDT.iter_mut().enumerate() {
            ent.set(table[i], seg);
        }
        let ptr = DescriptorTablePointer {
            limit: (core::mem::size_of::<[IdtEntry; 256]>() - 1) as u16,
            base: VirtAddr::new(core::ptr::addr_of!(IDT) as u64),
        };
        lidt(&ptr);
    }
}
