// src/logging/vga.rs
//
// VGA テキストモード(0xb8000)へのカーネルログ出力（実機のみ）。
// - init(): Writer を初期化
// - write_str() / end_line(): 1 行を部品ごとに書く
//
// 注意:
// - プロセス空間が有効なときの 0xb8000 は、そのプロセスの端末が裏なら
//   端末の裏バッファに向いている。ログもそちらに出る。

use core::fmt::{self, Write};
use spin::Mutex;
use volatile::Volatile;

const BUFFER_HEIGHT: usize = 25;
const BUFFER_WIDTH: usize = 80;
const VGA_TEXT: usize = 0xb8000;

#[derive(Clone, Copy)]
#[repr(u8)]
enum Color {
    Black = 0x0,
    LightGray = 0x7,
    LightRed = 0xC,
}

const fn color_code(fg: Color) -> u8 {
    (fg as u8) | ((Color::Black as u8) << 4)
}

#[repr(C)]
#[derive(Clone, Copy)]
struct ScreenChar {
    ascii_character: u8,
    color_code: u8,
}

#[repr(transparent)]
struct Buffer {
    chars: [[Volatile<ScreenChar>; BUFFER_WIDTH]; BUFFER_HEIGHT],
}

struct Writer {
    col: usize,
    color_code: u8,
    buffer: &'static mut Buffer,
}

impl Writer {
    fn write_byte(&mut self, byte: u8) {
        match byte {
            b'\n' => self.new_line(),
            byte => {
                if self.col >= BUFFER_WIDTH {
                    self.new_line();
                }
                let row = BUFFER_HEIGHT - 1;
                let col = self.col;
                self.buffer.chars[row][col].write(ScreenChar {
                    ascii_character: byte,
                    color_code: self.color_code,
                });
                self.col += 1;
            }
        }
    }

    fn new_line(&mut self) {
        for row in 1..BUFFER_HEIGHT {
            for col in 0..BUFFER_WIDTH {
                let ch = self.buffer.chars[row][col].read();
                self.buffer.chars[row - 1][col].write(ch);
            }
        }
        self.clear_row(BUFFER_HEIGHT - 1);
        self.col = 0;
        self.color_code = color_code(Color::LightGray);
    }

    fn clear_row(&mut self, row: usize) {
        let blank = ScreenChar {
            ascii_character: b' ',
            color_code: self.color_code,
        };
        for col in 0..BUFFER_WIDTH {
            self.buffer.chars[row][col].write(blank);
        }
    }
}

impl Write for Writer {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for b in s.bytes() {
            self.write_byte(b);
        }
        Ok(())
    }
}

static WRITER: Mutex<Option<Writer>> = Mutex::new(None);

pub fn init() {
    let writer = Writer {
        col: 0,
        color_code: color_code(Color::LightGray),
        buffer: unsafe { &mut *(VGA_TEXT as *mut Buffer) },
    };
    *WRITER.lock() = Some(writer);
}

/// 行の残りを赤で書く（ERROR 用）
pub fn set_error_color() {
    if let Some(ref mut w) = *WRITER.lock() {
        w.color_code = color_code(Color::LightRed);
    }
}

pub fn write_str(s: &str) {
    if let Some(ref mut w) = *WRITER.lock() {
        let _ = w.write_str(s);
    }
}

pub fn end_line() {
    write_str("\n");
}
