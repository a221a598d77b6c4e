// kernel/src/kernel/state_ref.rs
//
// 役割:
// - 割り込み / system call の入口から KernelState に届くための “唯一の入口” を提供する。
//
// やること:
// - KernelState を KernelEntry（型引数を消した窓口）として raw pointer で登録する。
// - 呼び出し側は with_kernel() 経由でのみ &mut dyn KernelEntry を得る。
//
// やらないこと:
// - 複雑な同期（単一コア前提。入口は割り込み禁止で入ってくる）
// - KernelState の所有権移動（所有は entry.rs 側のまま）

use core::cell::UnsafeCell;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, Ordering};

use crate::arch::ring3::SavedContext;
use crate::arch::Machine;
use crate::config::Layout;
use crate::fs::FileSystem;
use crate::kernel::devices::Devices;
use crate::kernel::{KernelState, TerminalId, Transfer};

/// 入口から見た KernelState
pub trait KernelEntry {
    fn on_timer(&mut self, interrupted: SavedContext) -> Transfer;
    fn on_syscall(&mut self, number: u32, arg: u32, bytes: &mut [u8], caller: SavedContext) -> Transfer;
    fn on_exception(&mut self, vector: u8) -> Transfer;
    fn on_terminal_switch(&mut self, to: TerminalId, interrupted: SavedContext) -> Transfer;
    /// ユーザポインタの範囲検査用
    fn layout(&self) -> Layout;
}

impl<M: Machine, D: Devices, F: FileSystem> KernelEntry for KernelState<M, D, F> {
    fn on_timer(&mut self, interrupted: SavedContext) -> Transfer {
        self.timer_tick(interrupted)
    }

    fn on_syscall(&mut self, number: u32, arg: u32, bytes: &mut [u8], caller: SavedContext) -> Transfer {
        self.syscall_raw(number, arg, bytes, caller)
    }

    fn on_exception(&mut self, vector: u8) -> Transfer {
        self.exception(vector)
    }

    fn on_terminal_switch(&mut self, to: TerminalId, interrupted: SavedContext) -> Transfer {
        self.switch_terminal(to, Some(interrupted))
    }

    fn layout(&self) -> Layout {
        *KernelState::layout(self)
    }
}

struct Slot(UnsafeCell<Option<NonNull<dyn KernelEntry>>>);

// Safety: 単一コア。書き換えは register / unregister だけで、どちらも入口が動く前 / 後に呼ぶ。
unsafe impl Sync for Slot {}

static SLOT: Slot = Slot(UnsafeCell::new(None));
static REGISTERED: AtomicBool = AtomicBool::new(false);

/// KernelState を登録する（entry.rs から呼ぶ）
pub fn register_kernel(ks: &mut (dyn KernelEntry + 'static)) {
    // Safety: 上の Sync の前提
    unsafe {
        *SLOT.0.get() = Some(NonNull::from(ks));
    }
    REGISTERED.store(true, Ordering::SeqCst);
}

/// 登録を外す（KernelState を捨てる前）
pub fn unregister_kernel() {
    REGISTERED.store(false, Ordering::SeqCst);
    unsafe {
        *SLOT.0.get() = None;
    }
}

/// KernelState を一時的に借用して処理する（入口側はこれだけ使う）
pub fn with_kernel<R>(f: impl FnOnce(&mut dyn KernelEntry) -> R) -> Option<R> {
    if !REGISTERED.load(Ordering::SeqCst) {
        return None;
    }
    // Safety:
    // - register_kernel() は KernelState の生存期間中のみ有効
    // - 入口は割り込み禁止で入るので、同時に 2 つの &mut は作られない
    let mut p = unsafe { (*SLOT.0.get())? };
    Some(f(unsafe { p.as_mut() }))
}
