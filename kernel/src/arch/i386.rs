// kernel/src/arch/i386.rs
//
// 役割:
// - 実機（32-bit 保護モード, 8259 PIC, 8253 PIT）向けの Machine 実装。
//
// やること:
// - CR3 / TSS / PIC / PIT / ユーザ空間への書き込みを実際に行う。
//
// やらないこと:
// - GDT / IDT の構築（ブート段で済ませ、TSS の場所だけここが持つ）
//
// 設計方針:
// - TSS は “ロード後に動かない” 静的領域に固定配置する。

use core::ptr::addr_of_mut;

use x86_64::structures::gdt::SegmentSelector;

use crate::arch::cpu;
use crate::arch::gdt::TaskStateSegment32;
use crate::arch::Machine;
use crate::config::PitProgram;
use crate::mem::addr::{PhysAddr, VirtAddr};

const PIC_MASTER_CMD: u16 = 0x20;
const PIC_MASTER_DATA: u16 = 0x21;
const PIC_SLAVE_CMD: u16 = 0xA0;
const PIC_SLAVE_DATA: u16 = 0xA1;
/// specific EOI
const PIC_EOI: u8 = 0x60;
/// slave がつながっている master の IRQ
const PIC_CASCADE_IRQ: u8 = 2;

const PIT_CMD_PORT: u16 = 0x43;
const PIT_DATA_PORT: u16 = 0x40;

static mut TSS: TaskStateSegment32 = TaskStateSegment32::new();

/// GDT の TSS descriptor に埋める base
pub fn tss_base() -> u32 {
    unsafe { addr_of_mut!(TSS) as u32 }
}

pub struct BareMetal {
    _private: (),
}

impl BareMetal {
    /// # Safety
    /// 1 つだけ作ること（TSS / PIC を排他的に扱う前提）。
    pub unsafe fn new() -> Self {
        BareMetal { _private: () }
    }
}

impl Machine for BareMetal {
    fn interrupts_enabled(&self) -> bool {
        cpu::interrupts_enabled()
    }

    fn disable_interrupts(&mut self) {
        cpu::disable_interrupts();
    }

    fn enable_interrupts(&mut self) {
        cpu::enable_interrupts();
    }

    fn load_page_directory(&mut self, root: PhysAddr) {
        unsafe { cpu::load_cr3(root.0) }
    }

    fn set_kernel_stack(&mut self, ss0: SegmentSelector, esp0: u32) {
        unsafe {
            let tss = addr_of_mut!(TSS);
            (*tss).ss0 = ss0.0;
            (*tss).esp0 = esp0;
        }
    }

    fn kernel_stack(&self) -> (SegmentSelector, u32) {
        unsafe {
            let tss = addr_of_mut!(TSS);
            (SegmentSelector((*tss).ss0), (*tss).esp0)
        }
    }

    fn end_of_interrupt(&mut self, irq: u8) {
        if irq >= 8 {
            cpu::outb(PIC_SLAVE_CMD, PIC_EOI | (irq - 8));
            cpu::outb(PIC_MASTER_CMD, PIC_EOI | PIC_CASCADE_IRQ);
        } else {
            cpu::outb(PIC_MASTER_CMD, PIC_EOI | irq);
        }
    }

    fn set_irq_mask(&mut self, irq: u8, masked: bool) {
        let (port, bit) = if irq >= 8 {
            (PIC_SLAVE_DATA, irq - 8)
        } else {
            (PIC_MASTER_DATA, irq)
        };
        let current = cpu::inb(port);
        let next = if masked { current | (1 << bit) } else { current & !(1 << bit) };
        cpu::outb(port, next);
    }

    fn program_timer(&mut self, program: PitProgram) {
        cpu::outb(PIT_CMD_PORT, program.command);
        cpu::outb(PIT_DATA_PORT, (program.divisor & 0xFF) as u8);
        cpu::outb(PIT_DATA_PORT, (program.divisor >> 8) as u8);
    }

    fn copy_to_user(&mut self, dst: VirtAddr, _phys: PhysAddr, bytes: &[u8]) {
        // 呼び出し側で対象空間を activate 済み
        unsafe {
            core::ptr::copy_nonoverlapping(bytes.as_ptr(), dst.0 as *mut u8, bytes.len());
        }
    }
}
