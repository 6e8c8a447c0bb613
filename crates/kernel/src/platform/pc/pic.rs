// 8259A PIC driver: the cascaded pair behind the IntCtrl contract.
// Vectors are fixed per line; the IPL maps onto the line mask window.

use spin::Mutex;

use crate::arch::x86_64::cpu::{inb, outb};
use crate::arch::TrapFrame;
use crate::ccb::{Ipl, IPL_CLOCK};
use crate::platform::interrupt::{HwInterrupt, IntCtrl, BASE_HWINT};
use crate::platform::IntCtrlKind;

const PIC_MASTER_CMD: u16 = 0x20;
const PIC_MASTER_DATA: u16 = 0x21;
const PIC_SLAVE_CMD: u16 = 0xA0;
const PIC_SLAVE_DATA: u16 = 0xA1;

// ICW1 bits
const PIC_ICW4: u8 = 1 << 0;
const PIC_INIT: u8 = 1 << 4;

// ICW4 bits
const PIC_X86: u8 = 1 << 0;

// OCW2 / OCW3
const PIC_EOI: u8 = 1 << 5;
const PIC_READ_ISR: u8 = 0x0B;

const NUM_LINES: u32 = 16;

struct PicState {
    /// Per-line mask as the kernel wants it, independent of the IPL
    /// window. Bit set = masked.
    line_mask: u16,
}

pub struct Pic {
    state: Mutex<PicState>,
}

/// IPL assigned to a line: line 0 is the highest.
fn line_ipl(line: u32) -> Ipl {
    IPL_CLOCK - (line as Ipl + 1)
}

/// Reads the in-service registers of both PICs.
fn read_isr() -> u16 {
    unsafe {
        outb(PIC_MASTER_CMD, PIC_READ_ISR);
        outb(PIC_SLAVE_CMD, PIC_READ_ISR);
        ((inb(PIC_SLAVE_CMD) as u16) << 8) | inb(PIC_MASTER_CMD) as u16
    }
}

impl Pic {
    fn write_masks(&self, mask: u16) {
        unsafe {
            outb(PIC_MASTER_DATA, mask as u8);
            outb(PIC_SLAVE_DATA, (mask >> 8) as u8);
        }
    }

    fn line_of(&self, hw: &HwInterrupt) -> u32 {
        hw.gsi
    }
}

impl IntCtrl for Pic {
    fn kind(&self) -> IntCtrlKind {
        IntCtrlKind::I8259A
    }

    fn begin_interrupt(&self, ctx: &mut TrapFrame) -> bool {
        let line = ctx.int_num().wrapping_sub(BASE_HWINT);
        // Lines 7 and 15 raise phantom interrupts; a clear ISR bit means
        // spurious
        if line == 7 && read_isr() & (1 << 7) == 0 {
            return false;
        }
        if line == 15 && read_isr() & (1 << 15) == 0 {
            // The master saw the cascade line; it still wants an EOI
            unsafe {
                outb(PIC_MASTER_CMD, PIC_EOI);
            }
            return false;
        }
        true
    }

    fn end_interrupt(&self, ctx: &mut TrapFrame) {
        let line = ctx.int_num().wrapping_sub(BASE_HWINT);
        unsafe {
            if line >= 8 {
                outb(PIC_SLAVE_CMD, PIC_EOI);
            }
            outb(PIC_MASTER_CMD, PIC_EOI);
        }
    }

    fn enable_interrupt(&self, hw: &HwInterrupt) {
        let line = self.line_of(hw);
        let mut st = self.state.lock();
        st.line_mask &= !(1 << line);
        self.write_masks(st.line_mask);
    }

    fn disable_interrupt(&self, hw: &HwInterrupt) {
        let line = self.line_of(hw);
        let mut st = self.state.lock();
        st.line_mask |= 1 << line;
        self.write_masks(st.line_mask);
    }

    fn set_ipl(&self, ipl: Ipl) {
        // Mask every line whose IPL is at or below the new level; with
        // line 0 as the highest IPL that is the tail of the line space
        let mut window: u16 = 0;
        for line in 0..NUM_LINES {
            if line_ipl(line) <= ipl {
                window |= 1 << line;
            }
        }
        let st = self.state.lock();
        self.write_masks(st.line_mask | window);
    }

    fn connect_interrupt(&self, hw: &HwInterrupt) -> Option<u32> {
        let line = self.line_of(hw);
        if line >= NUM_LINES {
            return None;
        }
        // The 8259A has no vector allocation freedom: the line decides
        // both the vector and the IPL
        hw.set_ipl(line_ipl(line));
        Some(line + BASE_HWINT)
    }

    fn disconnect_interrupt(&self, hw: &HwInterrupt) {
        self.disable_interrupt(hw);
    }

    fn get_vector(&self, ctx: &mut TrapFrame) -> Option<u32> {
        // Line vectors are fixed; the frame already carries it
        Some(ctx.int_num())
    }

    fn num_lines(&self) -> u32 {
        NUM_LINES
    }
}

static PIC: Pic = Pic {
    state: Mutex::new(PicState {
        // All lines masked except the cascade
        line_mask: 0xFFFB,
    }),
};

/// Programs the ICW bring-up sequence and masks every line.
pub fn init() -> &'static Pic {
    crate::debug!("pc: using 8259A as interrupt controller");
    unsafe {
        // ICW1: start initialization, expect ICW4
        outb(PIC_MASTER_CMD, PIC_ICW4 | PIC_INIT);
        outb(PIC_SLAVE_CMD, PIC_ICW4 | PIC_INIT);
        // ICW2: vector bases
        outb(PIC_MASTER_DATA, BASE_HWINT as u8);
        outb(PIC_SLAVE_DATA, BASE_HWINT as u8 + 8);
        // ICW3: cascade on line 2
        outb(PIC_MASTER_DATA, 1 << 2);
        outb(PIC_SLAVE_DATA, 2);
        // ICW4: 8086 mode
        outb(PIC_MASTER_DATA, PIC_X86);
        outb(PIC_SLAVE_DATA, PIC_X86);
        // Mask everything but the cascade line
        outb(PIC_MASTER_DATA, 0xFB);
        outb(PIC_SLAVE_DATA, 0xFF);
    }
    &PIC
}
