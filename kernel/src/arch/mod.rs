// kernel/src/arch/mod.rs
//
// アーキ依存部。unsafe をできるだけここに閉じ込める方針。
// - gdt:   セグメントセレクタ（と i386 の TSS 構造）
// - ring3: ring0 <-> ring3 の文脈（UserEntry / SavedContext）
// - sim:   ホスト上で core を動かすための記録型 Machine
// - cpu / i386: 実機（32-bit 保護モード）向け実装
//
// core（mem / kernel）は Machine trait 越しにしかハードウェアに触れない。

pub mod gdt;
pub mod ring3;

#[cfg(any(test, feature = "sim"))]
pub mod sim;

#[cfg(all(target_arch = "x86", target_os = "none"))]
pub mod cpu;
#[cfg(all(target_arch = "x86", target_os = "none"))]
pub mod i386;

use x86_64::structures::gdt::SegmentSelector;

use crate::config::PitProgram;
use crate::mem::addr::{PhysAddr, VirtAddr};

/// タイマ（PIT）の IRQ 番号
pub const PIT_IRQ: u8 = 0;

/// core から見た CPU / 割り込みコントローラの窓口。
pub trait Machine {
    fn interrupts_enabled(&self) -> bool;
    fn disable_interrupts(&mut self);
    fn enable_interrupts(&mut self);

    /// CR3 をロードする（TLB flush を伴う）。
    fn load_page_directory(&mut self, root: PhysAddr);

    /// TSS.ss0 / TSS.esp0 を設定する。
    fn set_kernel_stack(&mut self, ss0: SegmentSelector, esp0: u32);
    /// 現在の TSS.ss0 / TSS.esp0
    fn kernel_stack(&self) -> (SegmentSelector, u32);

    fn end_of_interrupt(&mut self, irq: u8);
    fn set_irq_mask(&mut self, irq: u8, masked: bool);
    fn program_timer(&mut self, program: PitProgram);

    /// 有効化済みのユーザ空間に実行ファイルの断片を書き込む。
    /// phys は dst を現在の空間で引いた結果（記録・検証用）。
    fn copy_to_user(&mut self, dst: VirtAddr, phys: PhysAddr, bytes: &[u8]);
}

/// 割り込みを止めた状態で f を実行し、IF を元に戻す。
/// 割り込みハンドラからも取るロックはこの中でだけ取る。
/// ホストでは割り込みが無いのでそのまま呼ぶ。
pub fn without_interrupts<R>(f: impl FnOnce() -> R) -> R {
    #[cfg(all(target_arch = "x86", target_os = "none"))]
    {
        let was_enabled = cpu::interrupts_enabled();
        if was_enabled {
            cpu::disable_interrupts();
        }
        let r = f();
        if was_enabled {
            cpu::enable_interrupts();
        }
        r
    }

    #[cfg(not(all(target_arch = "x86", target_os = "none")))]
    {
        f()
    }
}

/// CPU を停止させるループ
#[cfg(all(target_arch = "x86", target_os = "none"))]
pub fn halt_loop() -> ! {
    cpu::halt_loop()
}
