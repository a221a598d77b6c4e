// kernel/src/kernel/devices.rs
//
// 端末と RTC のドライバへの窓口。
// - 行バッファリング / 描画 / 割り込み待ちはドライバ側の仕事で、core は呼ぶだけ。
// - terminal_read は改行まで待つ可能性があるので、割り込み禁止区間から呼ばないこと。

use crate::kernel::terminal::TerminalId;
use crate::kernel::KernelError;

pub trait Devices {
    /// 端末の入力行を読む（読んだバイト数）
    fn terminal_read(&mut self, terminal: TerminalId, buf: &mut [u8]) -> Result<usize, KernelError>;
    /// 端末に書く（書いたバイト数）
    fn terminal_write(&mut self, terminal: TerminalId, buf: &[u8]) -> Result<usize, KernelError>;

    /// RTC を開く（周波数は 2Hz に戻る）
    fn rtc_open(&mut self) -> Result<(), KernelError>;
    /// 次の RTC 割り込みまで待つ
    fn rtc_wait(&mut self) -> Result<(), KernelError>;
    fn rtc_set_frequency(&mut self, hz: u32) -> Result<(), KernelError>;

    /// 表示端末が from から to に変わった（画面の退避・復帰）
    fn show_terminal(&mut self, from: TerminalId, to: TerminalId);
}
