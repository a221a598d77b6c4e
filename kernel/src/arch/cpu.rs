// src/arch/cpu.rs
// CPU 命令ラッパ（i386 実機）。unsafe は最小限。

use core::arch::asm;

/// CR0.PG
const CR0_PAGING: u32 = 1 << 31;
/// CR4.PSE（4MiB page）
const CR4_PSE: u32 = 1 << 4;
/// CR4.PGE（global page）
const CR4_PGE: u32 = 1 << 7;
/// EFLAGS.IF
const EFLAGS_IF: u32 = 1 << 9;

pub fn halt_loop() -> ! {
    loop {
        unsafe {
            asm!("hlt", options(nomem, nostack, preserves_flags));
        }
    }
}

#[inline(always)]
pub fn outb(port: u16, value: u8) {
    unsafe {
        asm!("out dx, al", in("dx") port, in("al") value, options(nomem, nostack, preserves_flags));
    }
}

#[inline(always)]
pub fn inb(port: u16) -> u8 {
    let value: u8;
    unsafe {
        asm!("in al, dx", out("al") value, in("dx") port, options(nomem, nostack, preserves_flags));
    }
    value
}

#[inline(always)]
pub fn disable_interrupts() {
    unsafe { asm!("cli", options(nomem, nostack)) }
}

#[inline(always)]
pub fn enable_interrupts() {
    unsafe { asm!("sti", options(nomem, nostack)) }
}

pub fn interrupts_enabled() -> bool {
    let eflags: u32;
    unsafe {
        asm!("pushfd", "pop {}", out(reg) eflags, options(nomem, preserves_flags));
    }
    eflags & EFLAGS_IF != 0
}

/// CR3 をロードする（global でない TLB エントリは flush される）。
///
/// # Safety
/// root は有効なページディレクトリの物理アドレスであること。
pub unsafe fn load_cr3(root: u32) {
    asm!("mov cr3, {}", in(reg) root, options(nostack, preserves_flags));
}

/// PSE / PGE を有効にしてからページングを入れる。
///
/// # Safety
/// 事前に CR3 に identity map 済みのディレクトリが入っていること。
pub unsafe fn enable_paging() {
    let mut cr4: u32;
    asm!("mov {}, cr4", out(reg) cr4, options(nomem, nostack, preserves_flags));
    cr4 |= CR4_PSE | CR4_PGE;
    asm!("mov cr4, {}", in(reg) cr4, options(nostack, preserves_flags));

    let mut cr0: u32;
    asm!("mov {}, cr0", out(reg) cr0, options(nomem, nostack, preserves_flags));
    cr0 |= CR0_PAGING;
    asm!("mov cr0, {}", in(reg) cr0, options(nostack, preserves_flags));
}
