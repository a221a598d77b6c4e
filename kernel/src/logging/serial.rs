// kernel/src/logging/serial.rs
//
// COM1 (0x3F8) への最小限のシリアル出力（実機のみ）。
// - init(): 115200bps, 8N1 に初期化
// - write_str(): 文字列を送信
// - end_line(): 改行を送信

use core::sync::atomic::{AtomicBool, Ordering};

use crate::arch::cpu::{inb, outb};

const COM1: u16 = 0x3F8;
/// LSR.THRE（送信バッファ空き）
const LSR_THR_EMPTY: u8 = 0x20;

static SERIAL_INITIALIZED: AtomicBool = AtomicBool::new(false);

pub fn init() {
    if SERIAL_INITIALIZED.swap(true, Ordering::SeqCst) {
        return;
    }

    outb(COM1 + 1, 0x00); // 割り込み無効
    outb(COM1 + 3, 0x80); // DLAB
    outb(COM1, 0x01); // divisor low (115200)
    outb(COM1 + 1, 0x00); // divisor high
    outb(COM1 + 3, 0x03); // 8N1
    outb(COM1 + 2, 0xC7); // FIFO
    outb(COM1 + 4, 0x0B);
}

fn write_byte(byte: u8) {
    while inb(COM1 + 5) & LSR_THR_EMPTY == 0 {}
    outb(COM1, byte);
}

pub fn write_str(s: &str) {
    for b in s.bytes() {
        write_byte(b);
    }
}

pub fn end_line() {
    write_str("\r\n");
}
