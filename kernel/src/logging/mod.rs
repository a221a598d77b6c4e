// kernel/src/logging/mod.rs
//
// カーネルログの入口。
// - info / warn / error: 固定文字列 1 行
// - info_u64 / info_kv / info_hex: " key = value" 形式の 1 行
//
// 出力先:
// - 実機（i386, target_os = "none"）: VGA テキスト + COM1
// - ホストのテスト: stderr（cargo test -- --nocapture で見える）
// - それ以外（sim feature でのホストビルド等）: 捨てる
//
// heap を使わず、数値も自前で文字列化する。

#[cfg(all(target_arch = "x86", target_os = "none"))]
mod serial;
#[cfg(all(target_arch = "x86", target_os = "none"))]
mod vga;

use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use spin::Mutex;

static VGA_ENABLED: AtomicBool = AtomicBool::new(true);
static ERROR_COUNT: AtomicU64 = AtomicU64::new(0);

/// 1 行を部品に分けて書くので、行の途中で他の出力が割り込まないようにする。
static LINE_LOCK: Mutex<()> = Mutex::new(());

#[derive(Clone, Copy, PartialEq, Eq)]
enum Level {
    Info,
    Warn,
    Error,
}

impl Level {
    fn prefix(self) -> &'static str {
        match self {
            Level::Info => "[INFO] ",
            Level::Warn => "[WARN] ",
            Level::Error => "[ERROR] ",
        }
    }
}

pub fn init() {
    #[cfg(all(target_arch = "x86", target_os = "none"))]
    {
        vga::init();
        serial::init();
    }
}

pub fn set_vga_enabled(enabled: bool) {
    VGA_ENABLED.store(enabled, Ordering::Relaxed);
}

pub fn is_vga_enabled() -> bool {
    VGA_ENABLED.load(Ordering::Relaxed)
}

/// 起動してから error を出した回数
pub fn error_count() -> u64 {
    ERROR_COUNT.load(Ordering::Relaxed)
}

fn emit(level: Level, parts: &[&str]) {
    if level == Level::Error {
        ERROR_COUNT.fetch_add(1, Ordering::Relaxed);
    }

    // ハンドラ内のログと取り合って止まらないよう、IF=0 の間だけ持つ
    crate::arch::without_interrupts(|| {
        let _guard = LINE_LOCK.lock();
        write_line(level, parts);
    });
}

fn write_line(level: Level, parts: &[&str]) {
    #[cfg(all(target_arch = "x86", target_os = "none"))]
    {
        let vga_on = is_vga_enabled();
        if vga_on && level == Level::Error {
            vga::set_error_color();
        }
        for p in core::iter::once(&level.prefix()).chain(parts.iter()) {
            if vga_on {
                vga::write_str(p);
            }
            serial::write_str(p);
        }
        if vga_on {
            vga::end_line();
        }
        serial::end_line();
    }

    #[cfg(test)]
    {
        let mut line = std::string::String::from(level.prefix());
        for p in parts {
            line.push_str(p);
        }
        std::eprintln!("{}", line);
    }

    #[cfg(not(any(test, all(target_arch = "x86", target_os = "none"))))]
    {
        let _ = (level, parts);
    }
}

pub fn info(msg: &str) {
    emit(Level::Info, &[msg]);
}

pub fn warn(msg: &str) {
    emit(Level::Warn, &[msg]);
}

pub fn error(msg: &str) {
    emit(Level::Error, &[msg]);
}

pub fn info_u64(label: &str, value: u64) {
    info_kv(label, value);
}

pub fn info_kv(key: &str, value: u64) {
    let mut buf = [0u8; 21];
    let s = u64_to_decimal(value, &mut buf);

    if key.is_empty() {
        emit(Level::Info, &[s]);
        return;
    }
    emit(Level::Info, &[key, " = ", s]);
}

/// アドレス向け（0x 付き 16 進）
pub fn info_hex(key: &str, value: u64) {
    let mut buf = [0u8; 18];
    let s = u64_to_hex(value, &mut buf);
    emit(Level::Info, &[key, " = ", s]);
}

/// 失敗理由付きの error（reason は KernelError::as_str() など）
pub fn error_kv(msg: &str, reason: &str) {
    emit(Level::Error, &[msg, ": ", reason]);
}

fn u64_to_decimal(mut value: u64, buf: &mut [u8; 21]) -> &str {
    if value == 0 {
        let last = buf.len() - 1;
        buf[last] = b'0';
        return ascii(&buf[last..]);
    }

    let mut i = buf.len();
    while value > 0 {
        let digit = (value % 10) as u8;
        i -= 1;
        buf[i] = b'0' + digit;
        value /= 10;
    }

    ascii(&buf[i..])
}

fn u64_to_hex(mut value: u64, buf: &mut [u8; 18]) -> &str {
    let mut i = buf.len();
    loop {
        let n = (value & 0xF) as u8;
        i -= 1;
        buf[i] = if n < 10 { b'0' + n } else { b'a' + (n - 10) };
        value >>= 4;
        if value == 0 {
            break;
        }
    }
    i -= 1;
    buf[i] = b'x';
    i -= 1;
    buf[i] = b'0';

    ascii(&buf[i..])
}

fn ascii(bytes: &[u8]) -> &str {
    // 上の 2 関数は ASCII の数字/英字しか書かない
    core::str::from_utf8(bytes).unwrap_or("?")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decimal_formatting() {
        let mut buf = [0u8; 21];
        assert_eq!(u64_to_decimal(0, &mut buf), "0");
        let mut buf = [0u8; 21];
        assert_eq!(u64_to_decimal(1_193_182, &mut buf), "1193182");
        let mut buf = [0u8; 21];
        assert_eq!(u64_to_decimal(u64::MAX, &mut buf), "18446744073709551615");
    }

    #[test]
    fn hex_formatting() {
        let mut buf = [0u8; 18];
        assert_eq!(u64_to_hex(0, &mut buf), "0x0");
        let mut buf = [0u8; 18];
        assert_eq!(u64_to_hex(0x0804_8000, &mut buf), "0x8048000");
        let mut buf = [0u8; 18];
        assert_eq!(u64_to_hex(u64::MAX, &mut buf), "0xffffffffffffffff");
    }

    #[test]
    fn error_counter_moves() {
        let before = error_count();
        error("logging self-test");
        assert!(error_count() > before);
    }

    #[test]
    fn lines_hold_the_lock_only_while_writing() {
        // 割り込み禁止区間の中からでも書ける
        let r = crate::arch::without_interrupts(|| {
            info("logging inside a critical section");
            7
        });
        assert_eq!(r, 7);
        // 行を書き終えたらロックは返っている
        drop(LINE_LOCK.lock());
        info_kv("logging after", 1);
    }
}
