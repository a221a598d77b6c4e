// kernel/src/config.rs
//
// 役割:
// - 環境依存の配置（物理/仮想アドレス定数）とタイマ周波数を 1 箇所に集める。
//
// やること:
// - プール容量・端末数などの “コンパイル時に固定する” 値を定数で持つ。
// - アドレス配置は Layout として値で持ち、起動時に validate() で形を検査する。
//
// やらないこと:
// - 実行時にレイアウトを動的に変える（boot 後は固定）
//
// 設計方針:
// - Layout::DEFAULT は 3 端末・6 プロセス構成の標準配置。
//   配置を変えたい環境は別の Layout を作って KernelState::new に渡す。

use core::fmt;

use crate::mem::addr::{PhysAddr, VirtAddr};
use crate::mem::layout::{LARGE_PAGE_SIZE, PAGE_SIZE};

/// 同時に存在できるプロセス（PCB）の最大数
pub const MAX_PROCESSES: usize = 6;

/// 仮想端末の数
pub const NUM_TERMINALS: usize = 3;

/// PCB ごとのファイルディスクリプタ数（0/1 は stdin/stdout 予約）
pub const MAX_OPEN_FILES: usize = 8;

/// プログラム名の最大長（ファイル名長と同じ）
pub const MAX_NAME_LEN: usize = 32;

/// 引数文字列の最大長
pub const MAX_ARGS_LEN: usize = 128;

/// 実行ファイル転送のチャンクサイズ
pub const LOADER_CHUNK: usize = 1024;

/// 端末が空になったときに起動し直すプログラム
pub const SHELL: &[u8] = b"shell";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConfigError {
    Misaligned(&'static str),
    OutOfRange(&'static str),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Misaligned(what) => write!(f, "misaligned: {}", what),
            ConfigError::OutOfRange(what) => write!(f, "out of range: {}", what),
        }
    }
}

/// 物理/仮想アドレス配置
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Layout {
    /// カーネル領域（identity, global, 4MiB 1 枚）
    pub kernel_region: PhysAddr,
    /// ユーザプログラムの 4MiB 窓（仮想）
    pub program_window: VirtAddr,
    /// slot 0 のプログラム窓の物理ベース。slot i は +4MiB*i
    pub program_phys_base: PhysAddr,
    /// 実行ファイルを書き込む仮想アドレス
    pub load_address: VirtAddr,
    /// 表示中 VGA テキストバッファ
    pub video: PhysAddr,
    /// 端末 0 の裏バッファ。端末 t は +4KiB*t
    pub video_buffers: PhysAddr,
    /// プロセスごとのカーネルスタック（兼 PCB 置き場）のサイズ
    pub kernel_stack_size: u32,
    /// カーネルスタック領域の上端（slot 0 がここから下に伸びる）
    pub kernel_stack_region_end: u32,
    /// どのプロセスにも属さないときの TSS.esp0
    pub global_kernel_stack: u32,
    /// ページング用 arena（MemoryManager）の物理配置
    pub paging_arena: PhysAddr,
}

impl Layout {
    pub const DEFAULT: Layout = Layout {
        kernel_region: PhysAddr(0x0040_0000),
        program_window: VirtAddr(0x0800_0000),
        program_phys_base: PhysAddr(0x0080_0000),
        load_address: VirtAddr(0x0804_8000),
        video: PhysAddr(0x000B_8000),
        video_buffers: PhysAddr(0x000B_9000),
        kernel_stack_size: 0x2000,
        kernel_stack_region_end: 0x0080_0000,
        global_kernel_stack: 0x0080_0000 - 4,
        paging_arena: PhysAddr(0x0060_0000),
    };

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.kernel_region.0 % LARGE_PAGE_SIZE != 0 || self.kernel_region.0 == 0 {
            return Err(ConfigError::Misaligned("kernel_region"));
        }
        if self.program_window.0 % LARGE_PAGE_SIZE != 0 || !self.program_window.is_large_region() {
            return Err(ConfigError::Misaligned("program_window"));
        }
        if self.program_window.0.checked_add(LARGE_PAGE_SIZE).is_none() {
            return Err(ConfigError::OutOfRange("program_window"));
        }
        if self.program_phys_base.0 % LARGE_PAGE_SIZE != 0 {
            return Err(ConfigError::Misaligned("program_phys_base"));
        }
        let last_slot_end = self.program_phys_base.0 as u64
            + (LARGE_PAGE_SIZE as u64) * (MAX_PROCESSES as u64);
        if last_slot_end > u32::MAX as u64 + 1 {
            return Err(ConfigError::OutOfRange("program_phys_base"));
        }
        if !self.in_program_window(self.load_address.0) {
            return Err(ConfigError::OutOfRange("load_address"));
        }
        if !self.video.is_aligned() || !self.video_buffers.is_aligned() {
            return Err(ConfigError::Misaligned("video"));
        }
        let buffers_end = self.video_buffers.0 as u64 + (PAGE_SIZE as u64) * (NUM_TERMINALS as u64);
        if buffers_end > LARGE_PAGE_SIZE as u64 || self.video.0 >= LARGE_PAGE_SIZE {
            return Err(ConfigError::OutOfRange("video"));
        }
        if !self.kernel_stack_size.is_power_of_two() || self.kernel_stack_size < PAGE_SIZE {
            return Err(ConfigError::Misaligned("kernel_stack_size"));
        }
        let stacks = self.kernel_stack_size as u64 * MAX_PROCESSES as u64;
        if (self.kernel_stack_region_end as u64) < stacks
            || self.kernel_stack_region_end % self.kernel_stack_size != 0
        {
            return Err(ConfigError::OutOfRange("kernel_stack_region_end"));
        }
        Ok(())
    }

    /// slot 固有のプログラム窓の物理ベース
    pub fn program_phys(&self, slot: usize) -> PhysAddr {
        self.program_phys_base.offset(LARGE_PAGE_SIZE * slot as u32)
    }

    pub fn program_window_end(&self) -> u32 {
        self.program_window.0 + LARGE_PAGE_SIZE
    }

    pub fn in_program_window(&self, addr: u32) -> bool {
        addr >= self.program_window.0 && addr < self.program_window_end()
    }

    /// ユーザスタック初期値（窓の最上位ワード）
    pub fn user_stack_top(&self) -> u32 {
        self.program_window_end() - 4
    }

    pub fn video_buffer(&self, terminal: usize) -> PhysAddr {
        self.video_buffers.offset(PAGE_SIZE * terminal as u32)
    }

    /// slot の PCB が置かれる位置（カーネルスタック領域の底）
    pub fn pcb_address(&self, slot: usize) -> u32 {
        self.kernel_stack_region_end - self.kernel_stack_size * (slot as u32 + 1)
    }

    /// slot のカーネルスタック初期値（TSS.esp0）
    pub fn kernel_stack_top(&self, slot: usize) -> u32 {
        self.kernel_stack_region_end - self.kernel_stack_size * slot as u32 - 4
    }
}

impl Default for Layout {
    fn default() -> Self {
        Layout::DEFAULT
    }
}

//
// ──────────────────────────────────────────────
// PIT（スケジューラ tick）
// ──────────────────────────────────────────────
//

pub const PIT_BASE_HZ: u32 = 1_193_182;
/// これ未満だと divisor が 16bit に収まらない
pub const PIT_MIN_HZ: u32 = 19;

/// channel 0 / lo-hi アクセス / mode 3（矩形波）
const PIT_CHANNEL: u8 = 0;
const PIT_ACCESS_LOHI: u8 = 0x30;
const PIT_MODE_SQUARE: u8 = 3;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimerConfig {
    pub hz: u32,
}

/// PIT に書き込むコマンドと分周値
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PitProgram {
    pub command: u8,
    pub divisor: u16,
}

impl TimerConfig {
    pub const DEFAULT: TimerConfig = TimerConfig { hz: 50 };

    pub fn program(&self) -> Result<PitProgram, ConfigError> {
        if self.hz < PIT_MIN_HZ || self.hz > PIT_BASE_HZ {
            return Err(ConfigError::OutOfRange("timer hz"));
        }
        let divisor = (PIT_BASE_HZ / self.hz) as u16;
        Ok(PitProgram {
            command: (PIT_CHANNEL << 6) | PIT_ACCESS_LOHI | (PIT_MODE_SQUARE << 1),
            divisor,
        })
    }
}

impl Default for TimerConfig {
    fn default() -> Self {
        TimerConfig::DEFAULT
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_layout_is_valid() {
        assert_eq!(Layout::DEFAULT.validate(), Ok(()));
    }

    #[test]
    fn derived_addresses() {
        let l = Layout::DEFAULT;
        assert_eq!(l.program_phys(0), PhysAddr(0x0080_0000));
        assert_eq!(l.program_phys(2), PhysAddr(0x0100_0000));
        assert_eq!(l.user_stack_top(), 0x083F_FFFC);
        assert_eq!(l.video_buffer(2), PhysAddr(0x000B_B000));
        assert_eq!(l.pcb_address(0), 0x007F_E000);
        assert_eq!(l.pcb_address(1), 0x007F_C000);
        assert_eq!(l.kernel_stack_top(0), 0x007F_FFFC);
        assert!(l.in_program_window(0x0804_8000));
        assert!(!l.in_program_window(0x0840_0000));
    }

    #[test]
    fn misaligned_window_is_rejected() {
        let mut l = Layout::DEFAULT;
        l.program_window = VirtAddr(0x0800_1000);
        assert_eq!(l.validate(), Err(ConfigError::Misaligned("program_window")));

        let mut l = Layout::DEFAULT;
        l.video_buffers = PhysAddr(0x003F_F000);
        assert_eq!(l.validate(), Err(ConfigError::OutOfRange("video")));
    }

    #[test]
    fn pit_program_for_default_rate() {
        let p = TimerConfig::DEFAULT.program().unwrap();
        assert_eq!(p.command, 0x36);
        assert_eq!(p.divisor, (1_193_182 / 50) as u16);

        assert!(TimerConfig { hz: 18 }.program().is_err());
        assert_eq!(TimerConfig { hz: 19 }.program().unwrap().divisor, 62_799);
    }
}
