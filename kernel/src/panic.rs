// kernel/src/panic.rs
//
// no_std カーネル用 panic ハンドラ。
// - 挙動は「緊急出力（ロック無し） → CPU 停止」に固定する。
// - logging は spin ロックを取るので使わない（ロック中の panic で固まる）。
// - 二重 panic は即停止。
// - message の文字列化は行わない。

use core::panic::PanicInfo;
use core::sync::atomic::{AtomicBool, Ordering};

use crate::arch::{self, cpu};

static PANIC_IN_PROGRESS: AtomicBool = AtomicBool::new(false);

const DEBUGCON: u16 = 0xE9;
const COM1_DATA: u16 = 0x3F8;
const COM1_LSR: u16 = 0x3FD;
/// LSR: 送信バッファ空き
const LSR_THR_EMPTY: u8 = 0x20;

fn emergency_write_byte(b: u8) {
    // QEMU debugcon
    cpu::outb(DEBUGCON, b);

    for _ in 0..10_000 {
        if cpu::inb(COM1_LSR) & LSR_THR_EMPTY != 0 {
            break;
        }
    }
    cpu::outb(COM1_DATA, b);
}

fn emergency_write_str(s: &str) {
    for b in s.bytes() {
        emergency_write_byte(b);
    }
}

fn emergency_write_hex_u32(v: u32) {
    emergency_write_str("0x");
    for i in (0..8).rev() {
        let n = ((v >> (i * 4)) & 0xF) as u8;
        let c = if n < 10 { b'0' + n } else { b'a' + (n - 10) };
        emergency_write_byte(c);
    }
}

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    cpu::disable_interrupts();

    if PANIC_IN_PROGRESS.swap(true, Ordering::AcqRel) {
        emergency_write_str("[PANIC] re-entered => halt\n");
        return arch::halt_loop();
    }

    emergency_write_str("[PANIC] kernel panic\n");

    match info.location() {
        Some(loc) => {
            emergency_write_str("[PANIC] ");
            emergency_write_str(loc.file());
            emergency_write_str(" line=");
            emergency_write_hex_u32(loc.line());
            emergency_write_str("\n");
        }
        None => emergency_write_str("[PANIC] location unknown\n"),
    }

    arch::halt_loop()
}
