// kernel/src/arch/sim.rs
//
// 役割:
// - 実機なしで core（mem / kernel）を動かすための Machine 実装。
//
// やること:
// - CR3 ロード、TSS 更新、EOI、IRQ mask、PIT 設定、ユーザ空間への書き込みを記録する。
//
// やらないこと:
// - 実際のメモリ書き込み（copy_to_user は件数・長さ・チェックサムだけ残す）
//
// 設計方針:
// - heap を使わない固定長の記録（no_std のまま sim feature で公開できるように）。

use x86_64::structures::gdt::SegmentSelector;

use crate::arch::gdt::KERNEL_DS;
use crate::arch::Machine;
use crate::config::PitProgram;
use crate::mem::addr::{PhysAddr, VirtAddr};

const COPY_LOG_CAP: usize = 64;
const IRQ_COUNT: usize = 16;

/// copy_to_user 1 回分の記録
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CopyRecord {
    pub virt: VirtAddr,
    pub phys: PhysAddr,
    pub len: usize,
    pub checksum: u32,
}

pub struct SimMachine {
    interrupts: bool,
    cr3: Option<PhysAddr>,
    cr3_loads: usize,
    tss: (SegmentSelector, u32),
    eoi: [u32; IRQ_COUNT],
    irq_mask: u16,
    timer: Option<PitProgram>,
    copies: [Option<CopyRecord>; COPY_LOG_CAP],
    copies_len: usize,
    bytes_copied: usize,
}

impl SimMachine {
    pub fn new() -> Self {
        SimMachine {
            interrupts: true,
            cr3: None,
            cr3_loads: 0,
            tss: (KERNEL_DS, 0),
            eoi: [0; IRQ_COUNT],
            irq_mask: 0xFFFF,
            timer: None,
            copies: [None; COPY_LOG_CAP],
            copies_len: 0,
            bytes_copied: 0,
        }
    }

    pub fn cr3(&self) -> Option<PhysAddr> {
        self.cr3
    }

    pub fn cr3_loads(&self) -> usize {
        self.cr3_loads
    }

    pub fn eoi_count(&self, irq: u8) -> u32 {
        self.eoi.get(irq as usize).copied().unwrap_or(0)
    }

    pub fn is_masked(&self, irq: u8) -> bool {
        irq as usize >= IRQ_COUNT || self.irq_mask & (1 << irq) != 0
    }

    pub fn timer(&self) -> Option<PitProgram> {
        self.timer
    }

    pub fn bytes_copied(&self) -> usize {
        self.bytes_copied
    }

    pub fn copies(&self) -> impl Iterator<Item = &CopyRecord> {
        self.copies[..self.copies_len].iter().flatten()
    }

    /// 記録済みの全チャンクのチェックサム合計
    pub fn copied_checksum(&self) -> u32 {
        self.copies().fold(0u32, |acc, c| acc.wrapping_add(c.checksum))
    }

    /// 次の検証のために書き込み記録だけ消す
    pub fn clear_copies(&mut self) {
        self.copies = [None; COPY_LOG_CAP];
        self.copies_len = 0;
        self.bytes_copied = 0;
    }
}

impl Default for SimMachine {
    fn default() -> Self {
        SimMachine::new()
    }
}

/// 単純な 8bit 和（転送内容の一致確認用）
pub fn checksum(bytes: &[u8]) -> u32 {
    bytes.iter().fold(0u32, |acc, b| acc.wrapping_add(*b as u32))
}

impl Machine for SimMachine {
    fn interrupts_enabled(&self) -> bool {
        self.interrupts
    }

    fn disable_interrupts(&mut self) {
        self.interrupts = false;
    }

    fn enable_interrupts(&mut self) {
        self.interrupts = true;
    }

    fn load_page_directory(&mut self, root: PhysAddr) {
        self.cr3 = Some(root);
        self.cr3_loads += 1;
    }

    fn set_kernel_stack(&mut self, ss0: SegmentSelector, esp0: u32) {
        self.tss = (ss0, esp0);
    }

    fn kernel_stack(&self) -> (SegmentSelector, u32) {
        self.tss
    }

    fn end_of_interrupt(&mut self, irq: u8) {
        if let Some(n) = self.eoi.get_mut(irq as usize) {
            *n += 1;
        }
    }

    fn set_irq_mask(&mut self, irq: u8, masked: bool) {
        if irq as usize >= IRQ_COUNT {
            return;
        }
        if masked {
            self.irq_mask |= 1 << irq;
        } else {
            self.irq_mask &= !(1 << irq);
        }
    }

    fn program_timer(&mut self, program: PitProgram) {
        self.timer = Some(program);
    }

    fn copy_to_user(&mut self, dst: VirtAddr, phys: PhysAddr, bytes: &[u8]) {
        self.bytes_copied += bytes.len();
        if self.copies_len < COPY_LOG_CAP {
            self.copies[self.copies_len] = Some(CopyRecord {
                virt: dst,
                phys,
                len: bytes.len(),
                checksum: checksum(bytes),
            });
            self.copies_len += 1;
        }
    }
}
